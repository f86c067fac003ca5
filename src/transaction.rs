/// How much of the device traffic the simulator records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionLogLevel {
    /// No transaction logging
    None,
    /// Log only addresses and lengths
    Minimal,
    /// Log data for program transactions => fully reconstructible
    WriteDataOnly,
    /// Log data for read and program transactions
    ReadWriteData,
    /// Log everything including data destroyed by erase transactions
    Full,
}

/// One recorded device operation.
#[derive(Debug, Clone)]
pub enum Transaction {
    Read {
        block: u16,
        page: u16,
        offset: usize,
        length: usize,
        data: Option<Vec<u8>>,
    },
    Program {
        block: u16,
        page: u16,
        offset: usize,
        data: Option<Vec<u8>>,
        after_write: Option<Vec<u8>>,
    },
    Erase {
        block: u16,
        data: Option<Vec<u8>>,
    },
}

impl Transaction {
    pub fn read(
        level: TransactionLogLevel,
        block: u16,
        page: u16,
        offset: usize,
        data: &[u8],
    ) -> Self {
        let logged = match level {
            TransactionLogLevel::ReadWriteData | TransactionLogLevel::Full => Some(data.to_vec()),
            _ => None,
        };
        Transaction::Read {
            block,
            page,
            offset,
            length: data.len(),
            data: logged,
        }
    }

    pub fn program(
        level: TransactionLogLevel,
        block: u16,
        page: u16,
        offset: usize,
        data: &[u8],
        after_write: &[u8],
    ) -> Self {
        let logged = match level {
            TransactionLogLevel::WriteDataOnly
            | TransactionLogLevel::ReadWriteData
            | TransactionLogLevel::Full => Some(data.to_vec()),
            _ => None,
        };
        let after = match level {
            TransactionLogLevel::Full => Some(after_write.to_vec()),
            _ => None,
        };
        Transaction::Program {
            block,
            page,
            offset,
            data: logged,
            after_write: after,
        }
    }

    pub fn erase(level: TransactionLogLevel, block: u16, data: &[u8]) -> Self {
        let logged = match level {
            TransactionLogLevel::Full => Some(data.to_vec()),
            _ => None,
        };
        Transaction::Erase { block, data: logged }
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::XlsxError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rejected by a business rule before any state changed.
    #[error("[{code}] {message}")]
    Business { code: &'static str, message: String },

    #[error("Row {row}: {message}")]
    RowParse { row: u32, message: String },

    #[error("Message decode error: {0}")]
    Decode(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("A request for record {0} is already pending")]
    AlreadyPending(i64),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl TallyError {
    pub fn blank_user_name() -> Self {
        TallyError::Business {
            code: "1001",
            message: "User name cannot be empty".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;

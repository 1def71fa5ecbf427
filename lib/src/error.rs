use std::backtrace::Backtrace;
use std::convert::Infallible;
use std::fmt::{Display, Formatter};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub backtrace: Backtrace,
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn not_found(what: impl Display) -> Self {
        Self::new(ErrorKind::NotFound(what.to_string()))
    }

    pub fn bad_input(msg: impl Display) -> Self {
        Self::new(ErrorKind::BadInput(msg.to_string()))
    }

    pub fn precondition(msg: impl Display) -> Self {
        Self::new(ErrorKind::Precondition(msg.to_string()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            write!(f, ", {}", self.backtrace)?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ErrorKind {
    #[error("io error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("config error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("failed parsing value from string: {0}")]
    ParsingError(String),

    #[error("http error: {0}")]
    HttpError(#[from] http::Error),
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("lettre email error: {0}")]
    LettreEmailError(#[from] lettre::error::Error),
    #[error("lettre smtp error: {0}")]
    LettreSmtpError(#[from] lettre::transport::smtp::Error),
    #[error("failed parsing email address: {0}")]
    EmailParseError(String),
    #[error("failed sending email through smtp: {0}")]
    EmailBadResponse(String),
    #[error("mail transport failed: {0}")]
    Transport(String),

    #[error("other error: {0}")]
    Other(String),

    #[error("bad input: {0}")]
    BadInput(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden")]
    Forbidden,

    /// Rendered mail output still contains template markers. Never sent.
    #[error("unresolved template variables in {0}")]
    UnresolvedTemplate(String),
    #[error("more than one matching payment: {0}")]
    AmbiguousPayment(String),
    #[error("receipt backup failed: {0}")]
    Backup(String),
    #[error("pdf rendering failed: {0}")]
    Pdf(String),

    #[error("db error: {0}")]
    DbError(String),
    #[cfg(feature = "sled")]
    #[error("sled db error: {0}")]
    SledError(#[from] sled::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("toml decode error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("toml encode error: {0}")]
    TomlSerError(#[from] toml::ser::Error),
    #[error("pot error: {0}")]
    PotError(#[from] pot::Error),
    #[error("csv error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("zip error: {0}")]
    ZipError(#[from] zip::result::ZipError),
    #[error("spreadsheet error: {0}")]
    SpreadsheetError(#[from] calamine::Error),

    #[error("template error: {0}")]
    TemplateError(#[from] minijinja::Error),
    #[error("layout error: {0}")]
    AskamaError(#[from] askama::Error),

    #[error("uuid error: {0}")]
    UuidError(#[from] uuid::Error),
    #[error("url parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("date parse error: {0}")]
    ChronoParseError(#[from] chrono::ParseError),
    #[error("decimal error: {0}")]
    DecimalError(#[from] rust_decimal::Error),
    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("infallible?")]
    Infallible(#[from] Infallible),
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Self::new(ErrorKind::Other(e))
    }
}

impl From<ErrorKind> for Error {
    fn from(k: ErrorKind) -> Self {
        Self::new(k)
    }
}

macro_rules! impl_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Error {
                fn from(e: $source) -> Self {
                    Self::new(ErrorKind::$variant(e))
                }
            }
        )*
    };
}

impl_from!(
    std::io::Error => StdIoError,
    config::ConfigError => ConfigError,
    http::Error => HttpError,
    reqwest::Error => ReqwestError,
    lettre::error::Error => LettreEmailError,
    lettre::transport::smtp::Error => LettreSmtpError,
    serde_json::Error => JsonError,
    serde_yaml::Error => YamlError,
    toml::de::Error => TomlError,
    toml::ser::Error => TomlSerError,
    pot::Error => PotError,
    csv::Error => CsvError,
    zip::result::ZipError => ZipError,
    calamine::Error => SpreadsheetError,
    minijinja::Error => TemplateError,
    askama::Error => AskamaError,
    uuid::Error => UuidError,
    url::ParseError => UrlParseError,
    chrono::ParseError => ChronoParseError,
    rust_decimal::Error => DecimalError,
    regex::Error => RegexError,
    Infallible => Infallible,
);

#[cfg(feature = "sled")]
impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Self::new(ErrorKind::SledError(e))
    }
}

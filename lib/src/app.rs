//! Application context handed to every service that talks to the outside
//! world.

use std::sync::Arc;

use dashmap::DashMap;

use crate::email::{MemoryTransport, SmtpTransport, Transport};
use crate::mailing::IntentRegistry;
use crate::receipt::pdf::{CommandPdfRenderer, EchoPdfRenderer, PdfRenderer};
use crate::{Config, Database, Id, Result};

#[derive(Clone)]
pub struct App {
    pub db: Database,
    pub config: Arc<Config>,
    pub transport: Arc<dyn Transport>,
    pub pdf: Arc<dyn PdfRenderer>,
    pub intents: Arc<IntentRegistry>,
    pub http: reqwest::Client,

    /// Serializes handling of status changes per payment.
    pub(crate) payment_locks: Arc<DashMap<Id, Arc<tokio::sync::Mutex<()>>>>,
}

impl App {
    /// Production setup: smtp transport and the configured pdf commands.
    pub fn new(db: Database, config: Config) -> Result<Self> {
        let transport = SmtpTransport::new(&config.email)?;
        let pdf = CommandPdfRenderer::new(&config.receipts);
        Ok(Self::with(db, config, Arc::new(transport), Arc::new(pdf)))
    }

    pub fn with(
        db: Database,
        config: Config,
        transport: Arc<dyn Transport>,
        pdf: Arc<dyn PdfRenderer>,
    ) -> Self {
        let intents = IntentRegistry::from_config(&config.mailing);
        Self {
            db,
            config: Arc::new(config),
            transport,
            pdf,
            intents: Arc::new(intents),
            http: reqwest::Client::new(),
            payment_locks: Arc::new(DashMap::new()),
        }
    }

    /// Temporary database, in-memory transport and pass-through pdf
    /// rendering. The transport handle is returned for inspecting sent mail.
    pub fn in_memory(config: Config) -> Result<(Self, Arc<MemoryTransport>)> {
        let transport = Arc::new(MemoryTransport::new());
        let app = Self::with(
            Database::temporary()?,
            config,
            transport.clone(),
            Arc::new(EchoPdfRenderer),
        );
        Ok((app, transport))
    }

    pub fn with_pdf(mut self, pdf: Arc<dyn PdfRenderer>) -> Self {
        self.pdf = pdf;
        self
    }

    /// Lock guarding the handling of one payment.
    pub fn payment_lock(&self, payment: Id) -> Arc<tokio::sync::Mutex<()>> {
        self.payment_locks
            .entry(payment)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

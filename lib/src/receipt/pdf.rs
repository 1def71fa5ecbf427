//! Pdf toolchain behind a trait.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ErrorKind;
use crate::util::random_code;
use crate::{config, Result};

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    /// Renders a single html document to pdf.
    async fn render(&self, html: &str) -> Result<Vec<u8>>;
    /// Encrypts the pdf so it opens with `password` only.
    async fn encrypt(&self, pdf: &[u8], password: &str) -> Result<Vec<u8>>;
}

/// Shells out to the configured commands, wkhtmltopdf and qpdf by default.
pub struct CommandPdfRenderer {
    html_to_pdf: Vec<String>,
    encrypt_pdf: Vec<String>,
}

impl CommandPdfRenderer {
    pub fn new(config: &config::Receipts) -> Self {
        Self {
            html_to_pdf: config.html_to_pdf.clone(),
            encrypt_pdf: config.encrypt_pdf.clone(),
        }
    }
}

fn split_command(command: &[String]) -> Result<(&String, &[String])> {
    command
        .split_first()
        .ok_or_else(|| ErrorKind::Pdf("no command configured".to_string()).into())
}

#[async_trait]
impl PdfRenderer for CommandPdfRenderer {
    async fn render(&self, html: &str) -> Result<Vec<u8>> {
        let (program, args) = split_command(&self.html_to_pdf)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let html = html.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&html).await {
                    tracing::warn!("failed writing html to pdf renderer: {e}");
                }
            });
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ErrorKind::Pdf(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ))
            .into());
        }
        Ok(output.stdout)
    }

    async fn encrypt(&self, pdf: &[u8], password: &str) -> Result<Vec<u8>> {
        let (program, args) = split_command(&self.encrypt_pdf)?;
        let dir = std::env::temp_dir();
        let stem = format!("receipt-{}", random_code(16));
        let input = dir.join(format!("{stem}.pdf"));
        let output = dir.join(format!("{stem}-encrypted.pdf"));
        tokio::fs::write(&input, pdf).await?;

        let args: Vec<String> = args
            .iter()
            .map(|arg| {
                arg.replace("{password}", password)
                    .replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect();
        let status = Command::new(program).args(&args).status().await;

        let result = match status {
            Ok(status) if status.success() => tokio::fs::read(&output).await.map_err(Into::into),
            Ok(status) => Err(ErrorKind::Pdf(format!("{program} exited with {status}")).into()),
            Err(e) => Err(e.into()),
        };
        let _ = tokio::fs::remove_file(&input).await;
        let _ = tokio::fs::remove_file(&output).await;
        result
    }
}

/// Passes the html through unchanged and marks encrypted output with the
/// password. For development setups without a pdf toolchain.
#[derive(Default)]
pub struct EchoPdfRenderer;

#[async_trait]
impl PdfRenderer for EchoPdfRenderer {
    async fn render(&self, html: &str) -> Result<Vec<u8>> {
        Ok(html.as_bytes().to_vec())
    }

    async fn encrypt(&self, pdf: &[u8], password: &str) -> Result<Vec<u8>> {
        let mut out = format!("encrypted:{password}\n").into_bytes();
        out.extend_from_slice(pdf);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let renderer = CommandPdfRenderer {
            html_to_pdf: vec![],
            encrypt_pdf: vec![],
        };
        let err = renderer.render("<p>x</p>").await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Pdf(_)));
    }

    #[tokio::test]
    async fn echo_marks_encryption() {
        let renderer = EchoPdfRenderer;
        let pdf = renderer.render("<p>x</p>").await.unwrap();
        let encrypted = renderer.encrypt(&pdf, "12345").await.unwrap();
        assert!(encrypted.starts_with(b"encrypted:12345\n"));
    }
}

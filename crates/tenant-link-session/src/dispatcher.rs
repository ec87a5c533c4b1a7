//! Outbound message dispatch.

use std::{path::Path, sync::Arc};

use tenant_link_core::{
    ConnectionHandle, MessageReceipt, OutgoingDocument, ProtocolError, TenantId,
};
use thiserror::Error;

use crate::{
    phone::PhoneFormat,
    registry::{SessionRegistry, SessionStatus},
};

/// Dispatch error.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Tenant {0} has no session")]
    NotInitialized(TenantId),
    #[error("Tenant {tenant} is not ready (status: {status:?})")]
    NotReady {
        tenant: TenantId,
        status: SessionStatus,
    },
    #[error("Invalid phone number: {0:?}")]
    InvalidPhone(String),
    #[error("Document not found: {0}")]
    DocumentMissing(String),
    #[error("Send failed: {0}")]
    Send(#[from] ProtocolError),
}

/// Sends messages through a tenant's ready connection.
pub struct MessageDispatcher {
    registry: Arc<SessionRegistry>,
    phone: PhoneFormat,
}

impl MessageDispatcher {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, phone: PhoneFormat) -> Self {
        Self { registry, phone }
    }

    /// Send a text message.
    ///
    /// # Errors
    /// Returns error if the tenant is not ready, the number is invalid or the
    /// protocol rejects the send.
    pub async fn try_send_text(
        &self,
        tenant: &TenantId,
        phone: &str,
        text: &str,
    ) -> Result<MessageReceipt, DispatchError> {
        let handle = self.ready_handle(tenant)?;
        let to = self.address(phone)?;
        let receipt = handle.send_text(&to, text).await?;
        tracing::debug!(tenant = %tenant, to = %to, id = %receipt.id, "Sent text");
        Ok(receipt)
    }

    /// Send a local file as a document.
    ///
    /// The file name defaults to the path's last component and the mimetype
    /// is inferred from the extension.
    ///
    /// # Errors
    /// Returns error if the tenant is not ready, the number is invalid, the
    /// file does not exist or the protocol rejects the send.
    pub async fn try_send_document(
        &self,
        tenant: &TenantId,
        phone: &str,
        path: &Path,
        caption: Option<&str>,
        file_name: Option<&str>,
    ) -> Result<MessageReceipt, DispatchError> {
        let handle = self.ready_handle(tenant)?;
        let to = self.address(phone)?;

        let is_file = tokio::fs::metadata(path)
            .await
            .is_ok_and(|meta| meta.is_file());
        if !is_file {
            return Err(DispatchError::DocumentMissing(path.display().to_string()));
        }

        let file_name = file_name.map_or_else(
            || {
                path.file_name()
                    .map_or_else(|| "document".to_owned(), |n| n.to_string_lossy().into_owned())
            },
            str::to_owned,
        );
        let document = OutgoingDocument {
            path: path.to_path_buf(),
            mimetype: mimetype_for(&file_name).to_owned(),
            file_name,
            caption: caption.map(str::to_owned),
        };

        let receipt = handle.send_document(&to, document).await?;
        tracing::debug!(tenant = %tenant, to = %to, id = %receipt.id, "Sent document");
        Ok(receipt)
    }

    /// Send a text message, reporting only success.
    pub async fn send_text(&self, tenant: &TenantId, phone: &str, text: &str) -> bool {
        match self.try_send_text(tenant, phone, text).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "Text not sent");
                false
            }
        }
    }

    /// Send a document, reporting only success.
    pub async fn send_document(
        &self,
        tenant: &TenantId,
        phone: &str,
        path: &Path,
        caption: Option<&str>,
        file_name: Option<&str>,
    ) -> bool {
        match self
            .try_send_document(tenant, phone, path, caption, file_name)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "Document not sent");
                false
            }
        }
    }

    fn ready_handle(
        &self,
        tenant: &TenantId,
    ) -> Result<Arc<dyn ConnectionHandle>, DispatchError> {
        let entry = self
            .registry
            .get(tenant)
            .ok_or_else(|| DispatchError::NotInitialized(tenant.clone()))?;
        match (entry.status, entry.handle) {
            (SessionStatus::Ready, Some(handle)) => Ok(handle),
            (status, _) => Err(DispatchError::NotReady {
                tenant: tenant.clone(),
                status,
            }),
        }
    }

    fn address(&self, phone: &str) -> Result<String, DispatchError> {
        self.phone
            .to_address(phone)
            .ok_or_else(|| DispatchError::InvalidPhone(phone.to_owned()))
    }
}

/// Mimetype for a file name, by extension.
#[must_use]
pub fn mimetype_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{registry::SessionEntry, testing::FakeHandle};

    fn dispatcher_with(status: SessionStatus) -> (MessageDispatcher, Arc<FakeHandle>, TenantId) {
        let registry = Arc::new(SessionRegistry::new());
        let handle = Arc::new(FakeHandle::default());
        let tenant = TenantId::from("acme");
        let mut entry = SessionEntry::connecting(1);
        entry.status = status;
        entry.handle = Some(Arc::clone(&handle) as Arc<dyn ConnectionHandle>);
        registry.upsert(tenant.clone(), entry);
        (
            MessageDispatcher::new(registry, PhoneFormat::default()),
            handle,
            tenant,
        )
    }

    fn temp_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{name}", std::process::id()));
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        path
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_not_initialized() {
        let dispatcher = MessageDispatcher::new(
            Arc::new(SessionRegistry::new()),
            PhoneFormat::default(),
        );
        let err = dispatcher
            .try_send_text(&TenantId::from("ghost"), "0812", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotInitialized(_)));
        assert!(!dispatcher.send_text(&TenantId::from("ghost"), "0812", "hi").await);
    }

    #[tokio::test]
    async fn test_not_ready_never_reaches_protocol() {
        let (dispatcher, handle, tenant) = dispatcher_with(SessionStatus::AwaitingPairing);

        let err = dispatcher
            .try_send_text(&tenant, "081234567890", "hello")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::NotReady {
                status: SessionStatus::AwaitingPairing,
                ..
            }
        ));
        assert!(handle.texts().is_empty());
    }

    #[tokio::test]
    async fn test_text_goes_to_normalized_address() {
        let (dispatcher, handle, tenant) = dispatcher_with(SessionStatus::Ready);

        assert!(dispatcher.send_text(&tenant, "0812-3456-7890", "hello").await);
        assert_eq!(
            handle.texts(),
            vec![("6281234567890@s.whatsapp.net".to_owned(), "hello".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_protocol_rejection_is_reported() {
        let (dispatcher, handle, tenant) = dispatcher_with(SessionStatus::Ready);
        handle.fail_sends();

        let err = dispatcher
            .try_send_text(&tenant, "081234567890", "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Send(_)));
        assert!(!dispatcher.send_text(&tenant, "081234567890", "hello").await);
    }

    #[tokio::test]
    async fn test_invalid_phone_is_rejected() {
        let (dispatcher, handle, tenant) = dispatcher_with(SessionStatus::Ready);
        let err = dispatcher.try_send_text(&tenant, "--", "hi").await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPhone(_)));
        assert!(handle.texts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_document_is_rejected() {
        let (dispatcher, handle, tenant) = dispatcher_with(SessionStatus::Ready);
        let path = std::env::temp_dir().join("tenant-link-no-such-file.pdf");

        let err = dispatcher
            .try_send_document(&tenant, "081234567890", &path, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DocumentMissing(_)));
        assert!(handle.documents().is_empty());
    }

    #[tokio::test]
    async fn test_document_defaults_name_and_mimetype() {
        let (dispatcher, handle, tenant) = dispatcher_with(SessionStatus::Ready);
        let path = temp_file("invoice.pdf");

        let receipt = dispatcher
            .try_send_document(&tenant, "6281234567890", &path, Some("March"), None)
            .await
            .unwrap();
        assert!(!receipt.id.is_empty());

        let sent = handle.documents();
        assert_eq!(sent.len(), 1);
        let (to, document) = &sent[0];
        assert_eq!(to, "6281234567890@s.whatsapp.net");
        assert_eq!(document.file_name, path.file_name().unwrap().to_string_lossy());
        assert_eq!(document.mimetype, "application/pdf");
        assert_eq!(document.caption.as_deref(), Some("March"));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_explicit_file_name_drives_mimetype() {
        let (dispatcher, handle, tenant) = dispatcher_with(SessionStatus::Ready);
        let path = temp_file("upload.bin");

        assert!(
            dispatcher
                .send_document(&tenant, "081234567890", &path, None, Some("report.xlsx"))
                .await
        );
        let (_, document) = &handle.documents()[0];
        assert_eq!(document.file_name, "report.xlsx");
        assert_eq!(
            document.mimetype,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_mimetype_fallback() {
        assert_eq!(mimetype_for("photo.JPG"), "image/jpeg");
        assert_eq!(mimetype_for("notes.txt"), "text/plain");
        assert_eq!(mimetype_for("archive.tar.gz"), "application/octet-stream");
        assert_eq!(mimetype_for("README"), "application/octet-stream");
    }
}

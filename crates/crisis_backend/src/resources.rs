use crisis_domain::{RESOURCE_MAX_BYTES, ResourceRef, ResourceUpload, SessionId};

/// Content-derived id: the same bytes uploaded twice land on one resource.
pub(crate) fn resource_id_for(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    hash.to_hex().as_str()[..16].to_owned()
}

pub(crate) fn is_valid_resource_id(raw: &str) -> bool {
    raw.len() == 16 && raw.chars().all(|c| c.is_ascii_hexdigit())
}

pub(crate) fn validate_upload(upload: &ResourceUpload) -> Result<(), String> {
    if upload.bytes.is_empty() {
        return Err("resource is empty".to_owned());
    }
    if upload.bytes.len() > RESOURCE_MAX_BYTES {
        return Err(format!(
            "resource is too large: {} bytes (max {RESOURCE_MAX_BYTES})",
            upload.bytes.len()
        ));
    }
    Ok(())
}

pub(crate) fn resource_ref(session_id: &SessionId, upload: &ResourceUpload) -> ResourceRef {
    ResourceRef {
        id: resource_id_for(&upload.bytes),
        session_id: session_id.clone(),
        name: upload.name.clone(),
        mime: upload.mime.clone(),
        byte_len: upload.bytes.len() as u64,
        created_at_unix_ms: upload.created_at_unix_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ids_are_stable_and_short() {
        let a = resource_id_for(b"hello");
        assert_eq!(a, resource_id_for(b"hello"));
        assert_ne!(a, resource_id_for(b"hello!"));
        assert!(is_valid_resource_id(&a));
        assert!(!is_valid_resource_id("../../etc"));
    }

    #[test]
    fn empty_and_oversized_uploads_are_rejected() {
        let mut upload = ResourceUpload {
            name: "plan.pdf".to_owned(),
            mime: "application/pdf".to_owned(),
            bytes: Vec::new(),
            created_at_unix_ms: 1,
        };
        assert!(validate_upload(&upload).is_err());
        upload.bytes = vec![0; RESOURCE_MAX_BYTES + 1];
        assert!(validate_upload(&upload).unwrap_err().contains("too large"));
        upload.bytes = vec![1; 8];
        assert!(validate_upload(&upload).is_ok());
    }
}

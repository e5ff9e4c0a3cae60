use crate::core::crypto;
use crate::core::epid;
use crate::core::kms::{KmsRequest, KmsResponse, KmsVersion};
use crate::core::server::ServerConfig;
use crate::core::{ClientRecord, ClientStore};
use crate::model::error::{Error, KmsError, KmsErrorKind, KmsResult};
use crate::model::rnd::random;
use log::{info, warn};
use std::io::Cursor;

/// Stable server side identity, immutable after start
pub struct ServerIdentity {
    /// Eight opaque bytes returned in V6 responses, configured
    /// or drawn once per process
    pub hwid: [u8; 8],
    /// Operator supplied EPID; when absent one is synthesized
    /// per application family
    pub epid: Option<String>,
    pub client_count: u32,
    pub max_clients: u32,
    pub license_count: u32,
    pub language: u32,
    pub activation_interval: u32,
    pub renewal_interval: u32,
}

impl ServerIdentity {
    pub fn new(config: &ServerConfig) -> Self {
        ServerIdentity {
            hwid: config.hwid.unwrap_or_else(epid::generate_hwid),
            epid: config.epid.clone(),
            client_count: config.client_count,
            max_clients: config.max_clients,
            license_count: config.license_count,
            language: config.language,
            activation_interval: config.activation_interval,
            renewal_interval: config.renewal_interval,
        }
    }
}

/// Turns one decoded activation blob into the blob to send
/// back. Pure given the identity and the store; the store is
/// advisory and never fails an activation.
pub struct Dispatcher<S> {
    identity: ServerIdentity,
    store: S,
}

impl<S: ClientStore> Dispatcher<S> {
    pub fn new(identity: ServerIdentity, store: S) -> Self {
        Dispatcher { identity, store }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn dispatch(&self, blob: &[u8]) -> KmsResult<Vec<u8>> {
        match KmsVersion::from_wire(blob)? {
            KmsVersion::V4 => self.dispatch_v4(blob),
            KmsVersion::V5 => self.dispatch_encrypted(blob, KmsVersion::V5, &crypto::V5_KEY),
            KmsVersion::V6 => self.dispatch_encrypted(blob, KmsVersion::V6, &crypto::V6_KEY),
        }
    }

    /// V4 travels in the clear with a trailing chained hash
    fn dispatch_v4(&self, blob: &[u8]) -> KmsResult<Vec<u8>> {
        if blob.len() <= 16 {
            return Err(Error::KmsError(KmsError::new(
                KmsErrorKind::ShortBuffer,
                "V4 blob shorter than its hash",
            )));
        }
        let (body, hash) = blob.split_at(blob.len() - 16);
        if crypto::chained_hash(&crypto::V4_KEY, body) != hash {
            return Err(Error::KmsError(KmsError::new(
                KmsErrorKind::AuthFailure,
                "V4 request hash mismatch",
            )));
        }
        let request = KmsRequest::from_bytes(&mut Cursor::new(body))?;
        let response = self.build_response(&request, None);

        let mut out = response.to_bytes()?;
        crypto::pad(&mut out);
        let response_hash = crypto::chained_hash(&crypto::V4_KEY, &out);
        out.extend_from_slice(&response_hash);
        Ok(out)
    }

    /// V5 and V6 carry a clear version word, then the IV as the
    /// first wire block, then the CBC encrypted body
    fn dispatch_encrypted(
        &self,
        blob: &[u8],
        version: KmsVersion,
        key: &[u8; 16],
    ) -> KmsResult<Vec<u8>> {
        if blob.len() < 4 + 2 * crypto::AES_BLOCK_SIZE {
            return Err(Error::KmsError(KmsError::new(
                KmsErrorKind::ShortBuffer,
                "encrypted blob shorter than IV and one block",
            )));
        }
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&blob[4..20]);
        let mut body = blob[20..].to_vec();
        crypto::cbc_decrypt(key, &iv, &mut body)?;
        crypto::unpad(&mut body).map_err(|_| {
            Error::KmsError(KmsError::new(
                KmsErrorKind::DecryptMismatch,
                "request did not decrypt to a padded body",
            ))
        })?;
        if body.len() < 4 {
            return Err(Error::KmsError(KmsError::new(
                KmsErrorKind::DecryptMismatch,
                "decrypted body shorter than its version field",
            )));
        }
        let inner = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        if inner != version.as_u32() {
            return Err(Error::KmsError(KmsError::new(
                KmsErrorKind::DecryptMismatch,
                "inner version differs from the outer one",
            )));
        }
        let request = KmsRequest::from_bytes(&mut Cursor::new(&body[..]))?;

        let mut salt = [0u8; 16];
        salt.copy_from_slice(&random(16));
        let response = self.build_response(&request, Some(salt));
        let mut out = response.to_bytes()?;
        if version == KmsVersion::V6 {
            let hmac_key = crypto::derive_hmac_key(&salt, request.request_time);
            let tag = crypto::hmac_tag(&hmac_key, &out)?;
            out.extend_from_slice(&tag);
        }
        crypto::pad(&mut out);
        crypto::cbc_encrypt(key, &salt, &mut out)?;

        let mut wire = Vec::with_capacity(4 + 16 + out.len());
        wire.extend_from_slice(&version.as_u32().to_le_bytes());
        wire.extend_from_slice(&salt);
        wire.extend_from_slice(&out);
        Ok(wire)
    }

    fn build_response(&self, request: &KmsRequest, salt: Option<[u8; 16]>) -> KmsResponse {
        info!(
            "activation request from {} (app {}, sku {}, N-count {})",
            request.machine_name, request.application_id, request.sku_id, request.required_client_count
        );

        let record = ClientRecord {
            client_machine_id: request.client_machine_id,
            application_id: request.application_id,
            sku_id: request.sku_id,
            license_status: request.license_status,
            last_activation: request.request_time,
            n_count: request.required_client_count,
            machine_name: request.machine_name.clone(),
        };
        if let Err(e) = self.store.upsert(&record) {
            // advisory, the activation is answered regardless
            warn!("client store write failed: {:?}", e);
        }

        let identity = &self.identity;
        let client_count = identity
            .max_clients
            .min(identity.client_count.max(request.required_client_count.saturating_add(1)));
        let epid = identity.epid.clone().unwrap_or_else(|| {
            epid::generate_epid(&request.application_id, identity.license_count, identity.language)
        });

        KmsResponse {
            version: request.version,
            client_machine_id: request.client_machine_id,
            response_time: request.request_time,
            client_count,
            vl_activation_interval: identity.activation_interval,
            vl_renewal_interval: identity.renewal_interval,
            epid,
            salt,
            hwid: if request.version == KmsVersion::V6 {
                Some(identity.hwid)
            } else {
                None
            },
            hmac: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryStore;
    use uuid::Uuid;

    const HWID: [u8; 8] = [0x36, 0x4F, 0x46, 0x3A, 0x88, 0x63, 0xD3, 0x5F];

    fn dispatcher() -> Dispatcher<MemoryStore> {
        let config = ServerConfig {
            hwid: Some(HWID),
            ..ServerConfig::default()
        };
        Dispatcher::new(ServerIdentity::new(&config), MemoryStore::new())
    }

    fn request(version: KmsVersion, sku: u128) -> KmsRequest {
        KmsRequest {
            version,
            is_client_vm: 0,
            license_status: 2,
            grace_time: 43200,
            application_id: epid::APP_WINDOWS,
            sku_id: Uuid::from_u128(sku),
            kms_counted_id: Uuid::from_u128(0x212a64dc_43b1_4d3d_a30c_2fc69d2095c6),
            client_machine_id: Uuid::from_u128(0x794f_1f09_3c1d_4c6a),
            required_client_count: 25,
            request_time: 132_000_000_000_000_000,
            previous_client_machine_id: Uuid::nil(),
            machine_name: String::from("TESTPC"),
            hw_info: if version == KmsVersion::V6 {
                Some([0u8; 8])
            } else {
                None
            },
        }
    }

    fn v4_blob(request: &KmsRequest) -> Vec<u8> {
        let mut blob = request.to_bytes().unwrap();
        crypto::pad(&mut blob);
        let hash = crypto::chained_hash(&crypto::V4_KEY, &blob);
        blob.extend_from_slice(&hash);
        blob
    }

    fn encrypted_blob(request: &KmsRequest, key: &[u8; 16], iv: [u8; 16]) -> Vec<u8> {
        let mut body = request.to_bytes().unwrap();
        crypto::pad(&mut body);
        crypto::cbc_encrypt(key, &iv, &mut body).unwrap();
        let mut blob = request.version.as_u32().to_le_bytes().to_vec();
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&body);
        blob
    }

    fn decrypt_response(blob: &[u8], key: &[u8; 16]) -> Vec<u8> {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&blob[4..20]);
        let mut body = blob[20..].to_vec();
        crypto::cbc_decrypt(key, &iv, &mut body).unwrap();
        crypto::unpad(&mut body).unwrap();
        body
    }

    #[test]
    fn test_v4_windows7_activation() {
        // Windows 7 Professional VL
        let dispatcher = dispatcher();
        let request = request(KmsVersion::V4, 0xae2ee509_1b34_41c0_acb7_6d4650168915);
        let blob = dispatcher.dispatch(&v4_blob(&request)).unwrap();

        // response hash verifies
        let (body, hash) = blob.split_at(blob.len() - 16);
        assert_eq!(crypto::chained_hash(&crypto::V4_KEY, body), hash);

        let response = KmsResponse::from_bytes(&mut Cursor::new(body)).unwrap();
        assert_eq!(response.version, KmsVersion::V4);
        assert_eq!(response.client_count, 50);
        assert_eq!(response.client_machine_id, request.client_machine_id);
        assert_eq!(response.response_time, request.request_time);
    }

    #[test]
    fn test_v4_rejects_tampered_hash() {
        let dispatcher = dispatcher();
        let mut blob = v4_blob(&request(KmsVersion::V4, 0x1));
        let tampered = blob.len() - 1;
        blob[tampered] ^= 0xFF;
        match dispatcher.dispatch(&blob) {
            Err(e) => assert_eq!(e.kind(), KmsErrorKind::AuthFailure),
            Ok(_) => panic!("expected AuthFailure"),
        }
    }

    #[test]
    fn test_v5_office2013_activation() {
        // Office 2013 VL, all zero client salt
        let dispatcher = dispatcher();
        let request = request(KmsVersion::V5, 0x2b88760d_d082_46d4_8f4d_30a5a2402c23);
        let blob = dispatcher
            .dispatch(&encrypted_blob(&request, &crypto::V5_KEY, [0u8; 16]))
            .unwrap();

        let body = decrypt_response(&blob, &crypto::V5_KEY);
        assert_eq!(&body[..4], [0x00, 0x00, 0x05, 0x00]);

        let response = KmsResponse::from_bytes(&mut Cursor::new(&body[..])).unwrap();
        assert_eq!(response.client_machine_id, request.client_machine_id);
        assert_eq!(
            u16::from_le_bytes([body[40], body[41]]) as usize,
            2 * (response.epid.len() + 1)
        );
        // the body echoes the wire salt
        assert_eq!(response.salt.unwrap().as_slice(), &blob[4..20]);
    }

    #[test]
    fn test_v6_windows10_activation() {
        // Windows 10 Enterprise VL
        let dispatcher = dispatcher();
        let request = request(KmsVersion::V6, 0x73111121_5638_40f6_bc11_f1d7b0d64300);
        let blob = dispatcher
            .dispatch(&encrypted_blob(&request, &crypto::V6_KEY, [0x42u8; 16]))
            .unwrap();

        let body = decrypt_response(&blob, &crypto::V6_KEY);
        assert_eq!(&body[..4], [0x00, 0x00, 0x06, 0x00]);

        let response = KmsResponse::from_bytes(&mut Cursor::new(&body[..])).unwrap();
        assert_eq!(response.hwid, Some(HWID));
        assert_ne!(response.hmac.unwrap(), [0u8; 32]);

        // tag recomputes over the body that precedes it
        let salt = response.salt.unwrap();
        let hmac_key = crypto::derive_hmac_key(&salt, request.request_time);
        let tag = crypto::hmac_tag(&hmac_key, &body[..body.len() - 32]).unwrap();
        assert_eq!(response.hmac.unwrap(), tag);
    }

    #[test]
    fn test_encrypted_inner_version_must_match() {
        let dispatcher = dispatcher();
        // a V5 body behind a V6 outer version decrypts to garbage
        let request = request(KmsVersion::V5, 0x1);
        let mut blob = encrypted_blob(&request, &crypto::V6_KEY, [1u8; 16]);
        blob[2] = 0x06;
        match dispatcher.dispatch(&blob) {
            Err(e) => assert!(matches!(
                e.kind(),
                KmsErrorKind::DecryptMismatch | KmsErrorKind::MalformedField
            )),
            Ok(_) => panic!("expected a decode failure"),
        }
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let dispatcher = dispatcher();
        match dispatcher.dispatch(&[0x00, 0x00, 0x07, 0x00, 1, 2, 3]) {
            Err(e) => assert_eq!(e.kind(), KmsErrorKind::UnknownVersion),
            Ok(_) => panic!("expected UnknownVersion"),
        }
    }

    #[test]
    fn test_count_respects_configured_maximum() {
        let config = ServerConfig {
            max_clients: 40,
            ..ServerConfig::default()
        };
        let dispatcher = Dispatcher::new(ServerIdentity::new(&config), MemoryStore::new());
        let mut request = request(KmsVersion::V4, 0x1);
        request.required_client_count = 90;
        let blob = dispatcher.dispatch(&v4_blob(&request)).unwrap();
        let response =
            KmsResponse::from_bytes(&mut Cursor::new(&blob[..blob.len() - 16])).unwrap();
        assert_eq!(response.client_count, 40);
    }

    #[test]
    fn test_count_floors_at_required_plus_one() {
        let dispatcher = dispatcher();
        let mut request = request(KmsVersion::V4, 0x1);
        request.required_client_count = 80;
        let blob = dispatcher.dispatch(&v4_blob(&request)).unwrap();
        let response =
            KmsResponse::from_bytes(&mut Cursor::new(&blob[..blob.len() - 16])).unwrap();
        assert_eq!(response.client_count, 81);
    }

    #[test]
    fn test_operator_epid_is_used_verbatim() {
        let config = ServerConfig {
            epid: Some(String::from("05426-00206-296-208306-04-2026")),
            ..ServerConfig::default()
        };
        let dispatcher = Dispatcher::new(ServerIdentity::new(&config), MemoryStore::new());
        let blob = dispatcher.dispatch(&v4_blob(&request(KmsVersion::V4, 0x1))).unwrap();
        let response =
            KmsResponse::from_bytes(&mut Cursor::new(&blob[..blob.len() - 16])).unwrap();
        assert_eq!(response.epid, "05426-00206-296-208306-04-2026");
    }

    #[test]
    fn test_dispatch_records_the_client() {
        let dispatcher = dispatcher();
        let request = request(KmsVersion::V4, 0x1);
        for _ in 0..3 {
            dispatcher.dispatch(&v4_blob(&request)).unwrap();
        }
        let rows = dispatcher.store().list();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client_machine_id, request.client_machine_id);
        assert_eq!(rows[0].last_activation, request.request_time);
        assert_eq!(rows[0].machine_name, "TESTPC");
    }

    #[test]
    fn test_store_failure_does_not_block_activation() {
        struct FailingStore;
        impl ClientStore for FailingStore {
            fn get(&self, _: &Uuid) -> Option<ClientRecord> {
                None
            }
            fn upsert(&self, _: &ClientRecord) -> KmsResult<()> {
                Err(Error::KmsError(KmsError::new(
                    KmsErrorKind::PersistenceError,
                    "disk full",
                )))
            }
            fn list(&self) -> Vec<ClientRecord> {
                Vec::new()
            }
        }

        let config = ServerConfig::default();
        let dispatcher = Dispatcher::new(ServerIdentity::new(&config), FailingStore);
        assert!(dispatcher.dispatch(&v4_blob(&request(KmsVersion::V4, 0x1))).is_ok());
    }
}

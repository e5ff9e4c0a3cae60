use crate::model::data::{DataType, DynOption, Message, MessageOption, U16, U32, U64};
use crate::model::error::{Error, KmsError, KmsErrorKind, KmsResult};
use crate::model::unicode::{from_utf16le_fixed, Unicode};
use chrono::Utc;
use num_enum::TryFromPrimitive;
use std::convert::{TryFrom, TryInto};
use std::io::Read;
use uuid::Uuid;

/// Width of the machine name field: 63 code units plus terminator
pub const MACHINE_NAME_BYTES: usize = 128;
pub const MACHINE_NAME_MAX_UNITS: usize = 63;

/// Request body sizes before AES padding
pub const REQUEST_BODY_SIZE: usize = 236;
pub const REQUEST_BODY_SIZE_V6: usize = 244;

/// Offset between the Windows epoch (1601-01-01) and the Unix
/// epoch, in 100ns ticks
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Current time as a Windows filetime
pub fn filetime_now() -> u64 {
    let now = Utc::now();
    FILETIME_UNIX_EPOCH
        + now.timestamp() as u64 * 10_000_000
        + now.timestamp_subsec_nanos() as u64 / 100
}

/// Protocol generation, encoded on the wire as major << 16 | minor
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum KmsVersion {
    V4 = 0x0004_0000,
    V5 = 0x0005_0000,
    V6 = 0x0006_0000,
}

impl KmsVersion {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Sniff the version from the first four bytes of an
    /// activation blob
    pub fn from_wire(raw: &[u8]) -> KmsResult<Self> {
        if raw.len() < 4 {
            return Err(Error::KmsError(KmsError::new(
                KmsErrorKind::ShortBuffer,
                "blob shorter than its version field",
            )));
        }
        let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        KmsVersion::try_from(value).map_err(|_| {
            Error::KmsError(KmsError::new(
                KmsErrorKind::UnknownVersion,
                "unsupported protocol version",
            ))
        })
    }
}

/// Read a mixed endian GUID (Data1/2/3 little endian, Data4 big
/// endian) from its 16 wire bytes
pub fn guid_read(raw: &[u8]) -> KmsResult<Uuid> {
    let bytes: [u8; 16] = raw.try_into().map_err(|_| {
        Error::KmsError(KmsError::new(KmsErrorKind::InvalidSize, "GUID is 16 bytes"))
    })?;
    Ok(Uuid::from_bytes_le(bytes))
}

/// Write a GUID in its mixed endian wire form
pub fn guid_write(id: &Uuid) -> Vec<u8> {
    id.to_bytes_le().to_vec()
}

fn machine_name_field(name: &str) -> KmsResult<Vec<u8>> {
    let mut raw = name.to_unicode();
    if raw.len() > MACHINE_NAME_MAX_UNITS * 2 {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::MalformedField,
            "machine name longer than 63 code units",
        )));
    }
    raw.resize(MACHINE_NAME_BYTES, 0);
    Ok(raw)
}

/// A decoded activation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsRequest {
    pub version: KmsVersion,
    pub is_client_vm: u32,
    pub license_status: u32,
    pub grace_time: u32,
    pub application_id: Uuid,
    pub sku_id: Uuid,
    pub kms_counted_id: Uuid,
    pub client_machine_id: Uuid,
    pub required_client_count: u32,
    pub request_time: u64,
    pub previous_client_machine_id: Uuid,
    pub machine_name: String,
    /// Only present on V6 requests
    pub hw_info: Option<[u8; 8]>,
}

impl KmsRequest {
    pub fn from_bytes(raw: &mut dyn Read) -> KmsResult<Self> {
        let mut message = component![
            "version" => U32::LE(0),
            "isClientVm" => U32::LE(0),
            "licenseStatus" => U32::LE(0),
            "graceTime" => U32::LE(0),
            "applicationId" => vec![0u8; 16],
            "skuId" => vec![0u8; 16],
            "kmsCountedId" => vec![0u8; 16],
            "clientMachineId" => vec![0u8; 16],
            "requiredClientCount" => U32::LE(0),
            "requestTime" => U64::LE(0),
            "previousClientMachineId" => vec![0u8; 16],
            "machineName" => vec![0u8; MACHINE_NAME_BYTES]
        ];
        message.read(raw)?;

        let version = KmsVersion::try_from(cast!(DataType::U32, message["version"])?)
            .map_err(|_| {
                Error::KmsError(KmsError::new(
                    KmsErrorKind::UnknownVersion,
                    "unsupported protocol version",
                ))
            })?;

        let hw_info = if version == KmsVersion::V6 {
            let mut info = [0u8; 8];
            raw.read_exact(&mut info)?;
            Some(info)
        } else {
            None
        };

        let machine_name = from_utf16le_fixed(cast!(DataType::Slice, message["machineName"])?)?;
        if machine_name.encode_utf16().count() > MACHINE_NAME_MAX_UNITS {
            return Err(Error::KmsError(KmsError::new(
                KmsErrorKind::MalformedField,
                "machine name field lacks its terminator",
            )));
        }

        Ok(KmsRequest {
            version,
            is_client_vm: cast!(DataType::U32, message["isClientVm"])?,
            license_status: cast!(DataType::U32, message["licenseStatus"])?,
            grace_time: cast!(DataType::U32, message["graceTime"])?,
            application_id: guid_read(cast!(DataType::Slice, message["applicationId"])?)?,
            sku_id: guid_read(cast!(DataType::Slice, message["skuId"])?)?,
            kms_counted_id: guid_read(cast!(DataType::Slice, message["kmsCountedId"])?)?,
            client_machine_id: guid_read(cast!(DataType::Slice, message["clientMachineId"])?)?,
            required_client_count: cast!(DataType::U32, message["requiredClientCount"])?,
            request_time: cast!(DataType::U64, message["requestTime"])?,
            previous_client_machine_id: guid_read(cast!(
                DataType::Slice,
                message["previousClientMachineId"]
            )?)?,
            machine_name,
            hw_info,
        })
    }

    pub fn to_bytes(&self) -> KmsResult<Vec<u8>> {
        let message = component![
            "version" => U32::LE(self.version.as_u32()),
            "isClientVm" => U32::LE(self.is_client_vm),
            "licenseStatus" => U32::LE(self.license_status),
            "graceTime" => U32::LE(self.grace_time),
            "applicationId" => guid_write(&self.application_id),
            "skuId" => guid_write(&self.sku_id),
            "kmsCountedId" => guid_write(&self.kms_counted_id),
            "clientMachineId" => guid_write(&self.client_machine_id),
            "requiredClientCount" => U32::LE(self.required_client_count),
            "requestTime" => U64::LE(self.request_time),
            "previousClientMachineId" => guid_write(&self.previous_client_machine_id),
            "machineName" => machine_name_field(&self.machine_name)?
        ];
        let mut buffer = Vec::with_capacity(message.length() as usize + 8);
        message.write(&mut buffer)?;
        if self.version == KmsVersion::V6 {
            let info = try_option!(self.hw_info, "V6 request without hardware info")?;
            buffer.extend_from_slice(&info);
        }
        Ok(buffer)
    }
}

/// An activation response, serialized as the plaintext body
/// before the version specific wrapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsResponse {
    pub version: KmsVersion,
    pub client_machine_id: Uuid,
    /// Echo of the client request time
    pub response_time: u64,
    pub client_count: u32,
    pub vl_activation_interval: u32,
    pub vl_renewal_interval: u32,
    pub epid: String,
    /// V5 and V6: the CBC IV, echoed inside the body
    pub salt: Option<[u8; 16]>,
    /// V6 only
    pub hwid: Option<[u8; 8]>,
    /// V6 only, computed over the body that precedes it
    pub hmac: Option<[u8; 32]>,
}

impl KmsResponse {
    /// Size in bytes of the EPID field including its terminator
    pub fn pid_size(&self) -> u16 {
        (self.epid.encode_utf16().count() as u16 + 1) * 2
    }

    pub fn to_bytes(&self) -> KmsResult<Vec<u8>> {
        let mut epid = self.epid.to_unicode();
        epid.extend_from_slice(&[0, 0]);
        let message = component![
            "version" => U32::LE(self.version.as_u32()),
            "clientMachineId" => guid_write(&self.client_machine_id),
            "responseTime" => U64::LE(self.response_time),
            "currentClientCount" => U32::LE(self.client_count),
            "vlActivationInterval" => U32::LE(self.vl_activation_interval),
            "vlRenewalInterval" => U32::LE(self.vl_renewal_interval),
            "pidSize" => U16::LE(self.pid_size()),
            "kmsEpid" => epid
        ];
        let mut buffer = Vec::with_capacity(message.length() as usize + 64);
        message.write(&mut buffer)?;
        if self.version != KmsVersion::V4 {
            let salt = try_option!(self.salt, "V5/V6 response without salt")?;
            buffer.extend_from_slice(&salt);
        }
        if self.version == KmsVersion::V6 {
            let hwid = try_option!(self.hwid, "V6 response without hardware id")?;
            buffer.extend_from_slice(&hwid);
            if let Some(tag) = self.hmac {
                buffer.extend_from_slice(&tag);
            }
        }
        Ok(buffer)
    }

    pub fn from_bytes(raw: &mut dyn Read) -> KmsResult<Self> {
        let mut message = component![
            "version" => U32::LE(0),
            "clientMachineId" => vec![0u8; 16],
            "responseTime" => U64::LE(0),
            "currentClientCount" => U32::LE(0),
            "vlActivationInterval" => U32::LE(0),
            "vlRenewalInterval" => U32::LE(0),
            "pidSize" => DynOption::new(U16::LE(0), |size| {
                MessageOption::Size("kmsEpid".to_string(), size.inner() as usize)
            }),
            "kmsEpid" => Vec::<u8>::new()
        ];
        message.read(raw)?;

        let version = KmsVersion::try_from(cast!(DataType::U32, message["version"])?)
            .map_err(|_| {
                Error::KmsError(KmsError::new(
                    KmsErrorKind::UnknownVersion,
                    "unsupported protocol version",
                ))
            })?;

        let mut salt = None;
        let mut hwid = None;
        let mut hmac = None;
        if version != KmsVersion::V4 {
            let mut buffer = [0u8; 16];
            raw.read_exact(&mut buffer)?;
            salt = Some(buffer);
        }
        if version == KmsVersion::V6 {
            let mut id = [0u8; 8];
            raw.read_exact(&mut id)?;
            hwid = Some(id);
            let mut tag = [0u8; 32];
            raw.read_exact(&mut tag)?;
            hmac = Some(tag);
        }

        Ok(KmsResponse {
            version,
            client_machine_id: guid_read(cast!(DataType::Slice, message["clientMachineId"])?)?,
            response_time: cast!(DataType::U64, message["responseTime"])?,
            client_count: cast!(DataType::U32, message["currentClientCount"])?,
            vl_activation_interval: cast!(DataType::U32, message["vlActivationInterval"])?,
            vl_renewal_interval: cast!(DataType::U32, message["vlRenewalInterval"])?,
            epid: from_utf16le_fixed(cast!(DataType::Slice, message["kmsEpid"])?)?,
            salt,
            hwid,
            hmac,
        })
    }
}

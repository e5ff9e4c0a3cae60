use crate::model::rnd::random;
use chrono::{Datelike, Utc};
use rand::Rng;
use uuid::Uuid;

/// Application families known to the host
pub const APP_WINDOWS: Uuid = Uuid::from_u128(0x55c92734_d682_4d71_983e_d6ec3f16059f);
pub const APP_OFFICE_2010: Uuid = Uuid::from_u128(0x59a52881_a989_479d_af46_f275c6370663);
pub const APP_OFFICE_2013: Uuid = Uuid::from_u128(0x0ff1ce15_a989_479d_af46_f275c6370663);

/// Group id of a volume license host
const GROUP_ID: u32 = 206;

struct PidEntry {
    /// Host platform id, e.g. 5426 for the Windows Server
    /// 2012 R2 family
    platform: u32,
    /// Base of the product style code; a randomized tail is
    /// added per generated EPID
    product_base: u32,
}

/// Host platform table, indexed by the application family of
/// the request. Unknown applications fall back to the Windows
/// entry.
fn pid_entry(application_id: &Uuid) -> PidEntry {
    if *application_id == APP_OFFICE_2010 {
        PidEntry {
            platform: 3612,
            product_base: 234_000,
        }
    } else if *application_id == APP_OFFICE_2013 {
        PidEntry {
            platform: 6401,
            product_base: 271_000,
        }
    } else {
        PidEntry {
            platform: 5426,
            product_base: 208_000,
        }
    }
}

/// Synthesize an extended PID for an application family
///
/// The shape is `AAAAA-BBBBB-CCC-DDDEEE-FF-GGGG`: platform id,
/// group id, license count, product style code, language id
/// high byte, current UTC year.
pub fn generate_epid(application_id: &Uuid, license_count: u32, language: u32) -> String {
    let entry = pid_entry(application_id);
    let product = entry.product_base + rand::thread_rng().gen_range(0..1000);
    format!(
        "{:05}-{:05}-{:03}-{:06}-{:02}-{:04}",
        entry.platform,
        GROUP_ID,
        license_count.min(999),
        product,
        (language >> 8) % 100,
        Utc::now().year()
    )
}

/// Generate the process lifetime hardware id
pub fn generate_hwid() -> [u8; 8] {
    let mut hwid = [0u8; 8];
    hwid.copy_from_slice(&random(8));
    hwid
}

use anyhow::Result;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use artstore_domain::{b64_to_hex, Entry};

use crate::core::config::{PolicyConfig, StorageLayout};

/// Characters left as-is in a path segment; everything else is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Control-plane download URL of a stored entry.
///
/// V1: `{base}/artifacts/{entity}/{md5 hex}`
/// V2: `{base}/artifactsV2/{region}/{entity}/{birth artifact id}/{md5 hex}`
pub(crate) fn file_url(
    base_url: &str,
    config: &PolicyConfig,
    entity: &str,
    entry: &Entry,
) -> Result<String> {
    let md5_hex = b64_to_hex(&entry.digest)?;
    Ok(match config.storage_layout {
        StorageLayout::V1 => format!("{base_url}/artifacts/{entity}/{md5_hex}"),
        StorageLayout::V2 => {
            let birth = entry.birth_artifact_id.as_deref().unwrap_or_default();
            format!(
                "{base_url}/artifactsV2/{}/{entity}/{}/{md5_hex}",
                config.storage_region,
                utf8_percent_encode(birth, SEGMENT)
            )
        }
    })
}

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// Receives every named memory region of the session. The core never does
/// I/O itself; serializers walk the regions through this trait and may
/// overwrite the bytes in place to restore.
pub trait StateVisitor {
    fn region(&mut self, tag: &str, data: &mut [u8]);
}

/// Exposes a `u16` as a little-endian region.
pub fn visit_u16(visitor: &mut dyn StateVisitor, tag: &str, value: &mut u16) {
    let mut bytes = value.to_le_bytes();
    visitor.region(tag, &mut bytes);
    *value = u16::from_le_bytes(bytes);
}

/// Exposes a `u32` as a little-endian region.
pub fn visit_u32(visitor: &mut dyn StateVisitor, tag: &str, value: &mut u32) {
    let mut bytes = value.to_le_bytes();
    visitor.region(tag, &mut bytes);
    *value = u32::from_le_bytes(bytes);
}

pub fn visit_u8(visitor: &mut dyn StateVisitor, tag: &str, value: &mut u8) {
    visitor.region(tag, std::slice::from_mut(value));
}

pub fn visit_bool(visitor: &mut dyn StateVisitor, tag: &str, value: &mut bool) {
    let mut byte = *value as u8;
    visit_u8(visitor, tag, &mut byte);
    *value = byte != 0;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRegion {
    pub tag: String,
    pub len: usize,
}

/// Collects `(tag, len)` pairs without touching the data.
#[derive(Default)]
pub struct RegionLister {
    pub regions: Vec<StateRegion>,
}

impl StateVisitor for RegionLister {
    fn region(&mut self, tag: &str, data: &mut [u8]) {
        self.regions.push(StateRegion {
            tag: tag.to_string(),
            len: data.len(),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRegion {
    tag: String,
    data: String,
}

/// Serialized copy of every registered region, stored as JSON with base64
/// payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    regions: Vec<SnapshotRegion>,
}

impl Snapshot {
    pub fn capturer() -> SnapshotCapture {
        SnapshotCapture {
            snapshot: Snapshot::default(),
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Decoded bytes of the first region tagged `tag`.
    pub fn region_bytes(&self, tag: &str) -> Result<Option<Vec<u8>>> {
        let Some(region) = self.regions.iter().find(|region| region.tag == tag) else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(&region.data)
            .with_context(|| format!("region {tag} is not valid base64"))?;
        Ok(Some(bytes))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode snapshot")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse snapshot JSON")
    }

    /// Decodes every region up front so a bad snapshot fails before any
    /// session memory is touched.
    pub fn restorer(&self) -> Result<SnapshotRestore> {
        let mut decoded = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            let bytes = STANDARD
                .decode(&region.data)
                .with_context(|| format!("region {} is not valid base64", region.tag))?;
            decoded.push((region.tag.clone(), bytes));
        }
        Ok(SnapshotRestore {
            regions: decoded,
            cursor: 0,
            mismatch: None,
        })
    }
}

pub struct SnapshotCapture {
    snapshot: Snapshot,
}

impl SnapshotCapture {
    pub fn finish(self) -> Snapshot {
        self.snapshot
    }
}

impl StateVisitor for SnapshotCapture {
    fn region(&mut self, tag: &str, data: &mut [u8]) {
        self.snapshot.regions.push(SnapshotRegion {
            tag: tag.to_string(),
            data: STANDARD.encode(data),
        });
    }
}

pub struct SnapshotRestore {
    regions: Vec<(String, Vec<u8>)>,
    cursor: usize,
    mismatch: Option<String>,
}

impl SnapshotRestore {
    /// Checks the layout against a live session without writing anything.
    pub fn validate(regions: &[StateRegion], snapshot: &Snapshot) -> Result<()> {
        if regions.len() != snapshot.regions.len() {
            bail!(
                "snapshot has {} regions, session expects {}",
                snapshot.regions.len(),
                regions.len()
            );
        }
        for (expected, stored) in regions.iter().zip(snapshot.regions.iter()) {
            if expected.tag != stored.tag {
                bail!(
                    "snapshot region {} found where {} was expected",
                    stored.tag,
                    expected.tag
                );
            }
            let len = STANDARD
                .decode(&stored.data)
                .with_context(|| format!("region {} is not valid base64", stored.tag))?
                .len();
            if len != expected.len {
                bail!(
                    "snapshot region {} holds {len} bytes, session expects {}",
                    stored.tag,
                    expected.len
                );
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        match self.mismatch {
            Some(message) => bail!(message),
            None => Ok(()),
        }
    }
}

impl StateVisitor for SnapshotRestore {
    fn region(&mut self, tag: &str, data: &mut [u8]) {
        let Some((stored_tag, bytes)) = self.regions.get(self.cursor) else {
            self.mismatch
                .get_or_insert_with(|| format!("snapshot ends before region {tag}"));
            return;
        };
        self.cursor += 1;
        if stored_tag != tag || bytes.len() != data.len() {
            self.mismatch.get_or_insert_with(|| {
                format!(
                    "snapshot region {stored_tag} ({} bytes) does not match {tag} ({} bytes)",
                    bytes.len(),
                    data.len()
                )
            });
            return;
        }
        data.copy_from_slice(bytes);
    }
}

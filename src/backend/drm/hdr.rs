//! HDR output metadata
//!
//! The metadata is sent to the sink as a property blob on the connector. A blob is only
//! created when the metadata changes, the blob it replaces is destroyed once the commit
//! carrying the new one went through.

use tracing::{debug, warn};

use super::{
    atomic::AtomicRequest,
    device::KmsDevice,
    error::{AccessError, Error},
};

/// `HDMI_STATIC_METADATA_TYPE1`
pub const HDMI_STATIC_METADATA_TYPE1: u32 = 0;

/// Size of `struct hdr_output_metadata`
pub const HDR_OUTPUT_METADATA_SIZE: usize = 32;

/// Electro-optical transfer function of the content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Eotf {
    /// SDR gamma
    #[default]
    TraditionalSdr = 0,
    /// HDR gamma
    TraditionalHdr = 1,
    /// SMPTE ST 2084, HDR10
    SmpteSt2084 = 2,
    /// Hybrid log-gamma
    Hlg = 3,
}

/// A chromaticity coordinate in units of 0.00002
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Chromaticity {
    pub x: u16,
    pub y: u16,
}

/// Static HDR metadata of the content, as in `struct hdr_output_metadata`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HdrOutputMetadata {
    pub eotf: Eotf,
    /// Red, green and blue primaries of the mastering display
    pub display_primaries: [Chromaticity; 3],
    pub white_point: Chromaticity,
    /// cd/m²
    pub max_display_mastering_luminance: u16,
    /// 0.0001 cd/m²
    pub min_display_mastering_luminance: u16,
    /// Maximum content light level, cd/m²
    pub max_cll: u16,
    /// Maximum frame-average light level, cd/m²
    pub max_fall: u16,
}

impl HdrOutputMetadata {
    /// Contents of the `HDR_OUTPUT_METADATA` blob
    pub fn to_bytes(&self) -> [u8; HDR_OUTPUT_METADATA_SIZE] {
        let mut out = [0u8; HDR_OUTPUT_METADATA_SIZE];
        out[0..4].copy_from_slice(&HDMI_STATIC_METADATA_TYPE1.to_ne_bytes());
        out[4] = self.eotf as u8;
        out[5] = HDMI_STATIC_METADATA_TYPE1 as u8;
        let mut words = Vec::with_capacity(12);
        for primary in self.display_primaries.iter().chain(Some(&self.white_point)) {
            words.push(primary.x);
            words.push(primary.y);
        }
        words.extend([
            self.max_display_mastering_luminance,
            self.min_display_mastering_luminance,
            self.max_cll,
            self.max_fall,
        ]);
        for (i, word) in words.iter().enumerate() {
            out[6 + i * 2..8 + i * 2].copy_from_slice(&word.to_ne_bytes());
        }
        out
    }
}

/// Metadata last sent to a connector
#[derive(Debug, Default)]
pub struct HdrState {
    property: u32,
    current: Option<HdrOutputMetadata>,
    blob: u32,
    dirty: bool,
    retired: Vec<u32>,
}

impl HdrState {
    /// Track the metadata of the connector property `property`, 0 if unsupported
    pub fn new(property: u32) -> HdrState {
        HdrState {
            property,
            ..Default::default()
        }
    }

    /// Whether the connector takes HDR metadata
    pub fn is_supported(&self) -> bool {
        self.property != 0
    }

    /// Metadata currently sent
    pub fn current(&self) -> Option<&HdrOutputMetadata> {
        self.current.as_ref()
    }

    /// Switch to `metadata`, returns whether it differs from the last value
    ///
    /// A new blob is created on change and attached by the next [`HdrState::attach`].
    pub fn update(
        &mut self,
        device: &dyn KmsDevice,
        metadata: Option<HdrOutputMetadata>,
    ) -> Result<bool, Error> {
        if !self.is_supported() || metadata == self.current {
            return Ok(false);
        }

        let blob = match &metadata {
            Some(metadata) => device.create_blob(&metadata.to_bytes()).map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to create HDR metadata blob",
                    dev: device.path(),
                    source,
                })
            })?,
            None => 0,
        };
        debug!(?metadata, blob, "HDR metadata changed");
        if self.blob != 0 {
            self.retired.push(self.blob);
        }
        self.blob = blob;
        self.current = metadata;
        self.dirty = true;
        Ok(true)
    }

    /// Add a changed blob to `request`
    pub fn attach(&mut self, request: &mut AtomicRequest, connector: u32) {
        if self.dirty {
            request.add(connector, self.property, self.blob as u64);
            self.dirty = false;
        }
    }

    /// Destroy the blobs replaced by a committed change
    pub fn release_retired(&mut self, device: &dyn KmsDevice) {
        for blob in self.retired.drain(..) {
            if let Err(err) = device.destroy_blob(blob) {
                warn!(blob, %err, "failed to destroy HDR metadata blob");
            }
        }
    }

    /// Destroy every blob, for teardown
    pub fn release_all(&mut self, device: &dyn KmsDevice) {
        if self.blob != 0 {
            self.retired.push(self.blob);
            self.blob = 0;
        }
        self.release_retired(device);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::drm::device::{test::MockKmsDevice, ModeInfo};

    fn hdr10() -> HdrOutputMetadata {
        HdrOutputMetadata {
            eotf: Eotf::SmpteSt2084,
            display_primaries: [
                Chromaticity { x: 34000, y: 16000 },
                Chromaticity { x: 13250, y: 34500 },
                Chromaticity { x: 7500, y: 3000 },
            ],
            white_point: Chromaticity { x: 15635, y: 16450 },
            max_display_mastering_luminance: 1000,
            min_display_mastering_luminance: 50,
            max_cll: 1000,
            max_fall: 400,
        }
    }

    #[test]
    fn blob_layout() {
        let bytes = hdr10().to_bytes();
        assert_eq!(&bytes[0..4], &0u32.to_ne_bytes());
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[6..8], &34000u16.to_ne_bytes());
        assert_eq!(&bytes[18..20], &15635u16.to_ne_bytes());
        assert_eq!(&bytes[22..24], &1000u16.to_ne_bytes());
        assert_eq!(&bytes[28..30], &400u16.to_ne_bytes());
        assert_eq!(&bytes[30..32], &[0, 0]);
    }

    #[test]
    fn only_changes_are_sent() {
        let device = MockKmsDevice::hdmi(vec![ModeInfo::new(1920, 1080, 60)]);
        let mut state = HdrState::new(3);

        assert!(state.update(&device, Some(hdr10())).unwrap());
        let mut request = AtomicRequest::new();
        state.attach(&mut request, 50);
        let first = request.get(50, 3).unwrap();
        assert_eq!(device.blobs().len(), 1);

        // same metadata, no new blob and nothing attached
        assert!(!state.update(&device, Some(hdr10())).unwrap());
        let mut request = AtomicRequest::new();
        state.attach(&mut request, 50);
        assert!(request.is_empty());
        assert_eq!(device.blobs().len(), 1);

        let mut brighter = hdr10();
        brighter.max_cll = 4000;
        assert!(state.update(&device, Some(brighter)).unwrap());
        state.attach(&mut request, 50);
        assert_ne!(request.get(50, 3), Some(first));
        assert!(device.destroyed_blobs().is_empty());
        state.release_retired(&device);
        assert_eq!(device.destroyed_blobs(), vec![first as u32]);

        // back to SDR detaches the blob
        assert!(state.update(&device, None).unwrap());
        let mut request = AtomicRequest::new();
        state.attach(&mut request, 50);
        assert_eq!(request.get(50, 3), Some(0));
        state.release_retired(&device);
        assert_eq!(device.destroyed_blobs().len(), 2);
    }

    #[test]
    fn unsupported_connector() {
        let device = MockKmsDevice::hdmi(vec![ModeInfo::new(1920, 1080, 60)]);
        let mut state = HdrState::new(0);
        assert!(!state.update(&device, Some(hdr10())).unwrap());
        assert!(device.blobs().is_empty());
    }
}

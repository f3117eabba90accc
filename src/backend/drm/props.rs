//! Property id discovery
//!
//! Atomic requests address properties by id. The ids are resolved by name once when
//! the device is opened and reused for every frame. A property the driver doesn't
//! expose keeps the id 0, which [`AtomicRequest::add`](super::AtomicRequest::add)
//! skips, disabling the feature depending on it.

use tracing::warn;

use super::{
    device::{KmsDevice, ObjectKind, PropertyInfo},
    error::{AccessError, Error},
};

/// Value of the plane `type` property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Extra plane blended above the primary plane
    Overlay,
    /// Plane carrying the main image of a CRTC
    Primary,
    /// Cursor plane
    Cursor,
}

impl PlaneType {
    fn from_raw(value: u64) -> Option<PlaneType> {
        match value {
            0 => Some(PlaneType::Overlay),
            1 => Some(PlaneType::Primary),
            2 => Some(PlaneType::Cursor),
            _ => None,
        }
    }
}

struct Discovered {
    object: u32,
    kind: ObjectKind,
    props: Vec<PropertyInfo>,
}

impl Discovered {
    fn read(device: &dyn KmsDevice, kind: ObjectKind, object: u32) -> Result<Discovered, Error> {
        let props = device.properties(kind, object).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to read object properties",
                dev: device.path(),
                source,
            })
        })?;
        Ok(Discovered { object, kind, props })
    }

    fn find(&self, name: &str) -> Option<&PropertyInfo> {
        self.props.iter().find(|prop| prop.name == name)
    }

    fn id(&self, name: &'static str) -> u32 {
        match self.find(name) {
            Some(prop) => prop.id,
            None => {
                warn!(object = self.object, kind = ?self.kind, name, "property not supported");
                0
            }
        }
    }

    fn value(&self, name: &str) -> Option<u64> {
        self.find(name).map(|prop| prop.value)
    }
}

/// Property ids of a CRTC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrtcProps {
    pub mode_id: u32,
    pub active: u32,
    pub out_fence_ptr: u32,
}

impl CrtcProps {
    /// Resolve the properties of `crtc`
    pub fn discover(device: &dyn KmsDevice, crtc: u32) -> Result<CrtcProps, Error> {
        let found = Discovered::read(device, ObjectKind::Crtc, crtc)?;
        Ok(CrtcProps {
            mode_id: found.id("MODE_ID"),
            active: found.id("ACTIVE"),
            out_fence_ptr: found.id("OUT_FENCE_PTR"),
        })
    }
}

/// Property ids of a connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorProps {
    pub crtc_id: u32,
    pub dpms: u32,
    pub hdr_output_metadata: u32,
    pub content_protection: u32,
}

impl ConnectorProps {
    /// Resolve the properties of `connector`
    pub fn discover(device: &dyn KmsDevice, connector: u32) -> Result<ConnectorProps, Error> {
        let found = Discovered::read(device, ObjectKind::Connector, connector)?;
        Ok(ConnectorProps {
            crtc_id: found.id("CRTC_ID"),
            dpms: found.id("DPMS"),
            hdr_output_metadata: found.id("HDR_OUTPUT_METADATA"),
            content_protection: found.id("Content Protection"),
        })
    }
}

/// Property ids of a plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneProps {
    pub fb_id: u32,
    pub crtc_id: u32,
    pub crtc_x: u32,
    pub crtc_y: u32,
    pub crtc_w: u32,
    pub crtc_h: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub src_w: u32,
    pub src_h: u32,
    pub in_fence_fd: u32,
    /// DTRC table offsets of compressed tiled buffers, i.MX8MQ only
    pub dtrc_table_ofs: u32,
}

impl PlaneProps {
    /// Resolve the properties of `plane`
    pub fn discover(device: &dyn KmsDevice, plane: u32) -> Result<PlaneProps, Error> {
        let found = Discovered::read(device, ObjectKind::Plane, plane)?;
        Ok(PlaneProps {
            fb_id: found.id("FB_ID"),
            crtc_id: found.id("CRTC_ID"),
            crtc_x: found.id("CRTC_X"),
            crtc_y: found.id("CRTC_Y"),
            crtc_w: found.id("CRTC_W"),
            crtc_h: found.id("CRTC_H"),
            src_x: found.id("SRC_X"),
            src_y: found.id("SRC_Y"),
            src_w: found.id("SRC_W"),
            src_h: found.id("SRC_H"),
            in_fence_fd: found.id("IN_FENCE_FD"),
            dtrc_table_ofs: found.id("dtrc_table_ofs"),
        })
    }
}

/// Type of `plane`, `None` if the driver doesn't report one
pub fn plane_type(device: &dyn KmsDevice, plane: u32) -> Result<Option<PlaneType>, Error> {
    let found = Discovered::read(device, ObjectKind::Plane, plane)?;
    Ok(found.value("type").and_then(PlaneType::from_raw))
}

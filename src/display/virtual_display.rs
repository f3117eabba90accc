//! Memory-backed displays
//!
//! A virtual display has no scan-out hardware. Frames end up in the output buffer
//! set by the client, typically for screen recording or casting.

use tracing::trace;

use crate::backend::{allocator::MemoryHandle, allocator::PixelFormat};

use super::{DisplayBackend, DisplayConfig, DisplayType, Error, Frame, PowerMode};

/// Backend of a virtual display
#[derive(Debug)]
pub struct VirtualBackend {
    config: DisplayConfig,
    output: Option<MemoryHandle>,
    power: PowerMode,
}

impl VirtualBackend {
    /// A virtual display of the given size
    pub fn new(width: u32, height: u32, format: PixelFormat) -> VirtualBackend {
        VirtualBackend {
            config: DisplayConfig::new(width, height, format),
            output: None,
            power: PowerMode::On,
        }
    }

    /// Buffer holding the last presented frame
    pub fn output(&self) -> Option<&MemoryHandle> {
        self.output.as_ref()
    }

    /// Power state last requested
    pub fn power_mode(&self) -> PowerMode {
        self.power
    }
}

impl DisplayBackend for VirtualBackend {
    fn display_type(&self) -> DisplayType {
        DisplayType::Virtual
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn read_configs(&mut self) -> (Vec<DisplayConfig>, Option<usize>) {
        (vec![self.config.clone()], Some(0))
    }

    fn update_screen(&mut self, frame: Frame<'_>) -> Result<(), Error> {
        trace!(buffer = frame.target.id(), composed = frame.composed, "virtual frame");
        self.output = Some(frame.target.clone());
        Ok(())
    }

    fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), Error> {
        self.power = mode;
        Ok(())
    }

    fn apply_config(&mut self, config: &DisplayConfig) -> Result<(), Error> {
        self.config = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::display::Layer;

    #[test]
    fn never_overlay_capable() {
        let backend = VirtualBackend::new(640, 480, PixelFormat::Rgba8888);
        assert!(!backend.check_overlay(&Layer::new(0)));
        assert_eq!(backend.display_type(), DisplayType::Virtual);
        assert!(backend.output().is_none());
    }
}

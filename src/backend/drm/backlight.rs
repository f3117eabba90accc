use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::utils::read_sysfs;

/// Default location of backlight devices
pub const BACKLIGHT_ROOT: &str = "/sys/class/backlight";

/// A sysfs backlight device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlight {
    path: PathBuf,
    max: u32,
}

impl Backlight {
    /// First backlight device below `root` with a valid `max_brightness`
    pub fn discover(root: impl AsRef<Path>) -> Option<Backlight> {
        let mut entries: Vec<PathBuf> = fs::read_dir(root.as_ref())
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        entries.into_iter().find_map(|path| {
            let max = read_sysfs(path.join("max_brightness")).ok()?.parse::<u32>().ok()?;
            if max == 0 {
                return None;
            }
            info!(path = %path.display(), max, "using backlight");
            Some(Backlight { path, max })
        })
    }

    /// Highest raw brightness value
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Set the brightness, `0.0..=1.0` maps onto `0..=max`
    pub fn set(&self, brightness: f32) -> io::Result<u32> {
        let value = (brightness.clamp(0.0, 1.0) * self.max as f32).round() as u32;
        debug!(brightness, value, "set backlight");
        fs::write(self.path.join("brightness"), value.to_string())?;
        Ok(value)
    }
}

//! Process wide services
//!
//! [`BootConfig`] holds the settings read once from the environment at startup,
//! [`ServiceContext`] the services shared by all displays of the process. Both are
//! created once and handed to the [`DisplayManager`](crate::manager::DisplayManager).

use std::{fmt, str::FromStr, sync::Arc};

use tracing::{info, warn};

use crate::{
    backend::{
        allocator::{dma_heap::DmaHeapAllocator, Allocator},
        composer::{Composer, ComposerPolicy},
        drm::{GuiResolution, ModeRequest},
    },
    display::Limitations,
};

/// Requested display mode
pub const ENV_DISPLAY_MODE: &str = "HWC_DISPLAY_MODE";
/// UI resolution override
pub const ENV_GUI_RESOLUTION: &str = "HWC_GUI_RESOLUTION";
/// Display backend, `drm` or `fb`
pub const ENV_BACKEND: &str = "HWC_BACKEND";
/// Never use the 2D engine
pub const ENV_DISABLE_2D: &str = "HWC_DISABLE_2D";
/// Prefer the 2D engine over the client
pub const ENV_2D_COMPOSITION: &str = "HWC_2D_COMPOSITION";
/// Put secure layers on the overlay plane
pub const ENV_SECURE_OVERLAY: &str = "HWC_SECURE_OVERLAY";
/// Generate vsync with a timer
pub const ENV_FAKE_VSYNC: &str = "HWC_FAKE_VSYNC";
/// The 2D engine corrupts layers blended with a plane alpha
pub const ENV_ALPHA_BLEND_ERRATUM: &str = "HWC_ALPHA_BLEND_ERRATUM";

/// Which kind of device the displays are driven through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// DRM/KMS atomic mode setting
    #[default]
    Drm,
    /// Legacy framebuffer devices
    Fb,
}

/// Error parsing a [`BackendKind`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown display backend `{0}`")]
pub struct ParseBackendError(String);

impl FromStr for BackendKind {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<BackendKind, ParseBackendError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drm" | "kms" => Ok(BackendKind::Drm),
            "fb" | "fbdev" => Ok(BackendKind::Fb),
            other => Err(ParseBackendError(other.to_owned())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Drm => f.write_str("drm"),
            BackendKind::Fb => f.write_str("fb"),
        }
    }
}

/// Settings fixed at boot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
    /// Mode of the primary display, `None` picks the preferred mode
    pub display_mode: Option<ModeRequest>,
    /// Render target size when smaller than the mode
    pub gui_resolution: Option<GuiResolution>,
    /// Display backend
    pub backend: BackendKind,
    /// Never use the 2D engine
    pub disable_2d: bool,
    /// Prefer the 2D engine over the client
    pub force_2d: bool,
    /// Put secure layers on the overlay plane
    pub secure_overlay: bool,
    /// Generate vsync with a timer
    pub fake_vsync: bool,
    /// Keep layers blended with a plane alpha away from the 2D engine
    pub alpha_blend_erratum: bool,
}

fn parse_flag(name: &str, value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "" | "0" | "false" | "no" | "off" => false,
        other => {
            warn!(name, value = other, "invalid boolean, assuming false");
            false
        }
    }
}

impl BootConfig {
    /// Read the settings from the process environment
    pub fn from_env() -> BootConfig {
        BootConfig::from_vars(|name| std::env::var(name).ok())
    }

    /// Read the settings through `var`, invalid values fall back to the defaults
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> BootConfig {
        let mut config = BootConfig::default();
        if let Some(value) = var(ENV_DISPLAY_MODE) {
            match value.parse() {
                Ok(mode) => config.display_mode = Some(mode),
                Err(err) => warn!(%err, "ignoring {}", ENV_DISPLAY_MODE),
            }
        }
        if let Some(value) = var(ENV_GUI_RESOLUTION) {
            match value.parse() {
                Ok(gui) => config.gui_resolution = Some(gui),
                Err(err) => warn!(%err, "ignoring {}", ENV_GUI_RESOLUTION),
            }
        }
        if let Some(value) = var(ENV_BACKEND) {
            match value.parse() {
                Ok(backend) => config.backend = backend,
                Err(err) => warn!(%err, "ignoring {}", ENV_BACKEND),
            }
        }
        let flag = |name: &str| var(name).map_or(false, |value| parse_flag(name, &value));
        config.disable_2d = flag(ENV_DISABLE_2D);
        config.force_2d = flag(ENV_2D_COMPOSITION);
        config.secure_overlay = flag(ENV_SECURE_OVERLAY);
        config.fake_vsync = flag(ENV_FAKE_VSYNC);
        config.alpha_blend_erratum = flag(ENV_ALPHA_BLEND_ERRATUM);
        config
    }

    /// Display pipeline limitations of these settings
    pub fn limitations(&self) -> Limitations {
        let mut limitations = Limitations::empty();
        limitations.set(Limitations::ALPHA_BLEND_ERRATUM, self.alpha_blend_erratum);
        limitations
    }

    /// Composer policy of these settings
    pub fn composer_policy(&self) -> ComposerPolicy {
        ComposerPolicy {
            disabled: self.disable_2d,
            force_2d: self.force_2d,
        }
    }
}

/// Services shared by all displays
#[derive(Debug, Clone)]
pub struct ServiceContext {
    boot: BootConfig,
    allocator: Option<Arc<dyn Allocator>>,
    composer: Arc<Composer>,
}

impl ServiceContext {
    /// Assemble a context from existing services
    pub fn new(
        boot: BootConfig,
        allocator: Option<Arc<dyn Allocator>>,
        composer: Arc<Composer>,
    ) -> ServiceContext {
        ServiceContext {
            boot,
            allocator,
            composer,
        }
    }

    /// Open the platform allocator and load the 2D engine
    pub fn load(boot: BootConfig) -> ServiceContext {
        let allocator: Arc<dyn Allocator> = Arc::new(DmaHeapAllocator::new());
        let composer = Arc::new(Composer::load(Some(allocator.clone()), boot.composer_policy()));
        info!(backend = %boot.backend, engine = composer.is_valid(), "services loaded");
        ServiceContext::new(boot, Some(allocator), composer)
    }

    /// Settings fixed at boot
    pub fn boot_config(&self) -> &BootConfig {
        &self.boot
    }

    /// Buffer allocation service, if any
    pub fn allocator(&self) -> Option<&Arc<dyn Allocator>> {
        self.allocator.as_ref()
    }

    /// Device composition service
    pub fn composer(&self) -> &Arc<Composer> {
        &self.composer
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn boot(vars: &[(&str, &str)]) -> BootConfig {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        BootConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = boot(&[]);
        assert_eq!(config, BootConfig::default());
        assert_eq!(config.backend, BackendKind::Drm);
        assert_eq!(config.composer_policy(), ComposerPolicy::default());
        assert!(config.limitations().is_empty());
    }

    #[test]
    fn full_environment() {
        let config = boot(&[
            (ENV_DISPLAY_MODE, "1920x1080@50"),
            (ENV_GUI_RESOLUTION, "shw1280x720"),
            (ENV_BACKEND, "fb"),
            (ENV_DISABLE_2D, "1"),
            (ENV_2D_COMPOSITION, "true"),
            (ENV_SECURE_OVERLAY, "yes"),
            (ENV_FAKE_VSYNC, "0"),
            (ENV_ALPHA_BLEND_ERRATUM, "on"),
        ]);
        assert_eq!(config.display_mode, Some(ModeRequest::size(1920, 1080).at(50)));
        assert_eq!(
            config.gui_resolution,
            Some(GuiResolution {
                width: 1280,
                height: 720,
                hardware_scaling: true
            })
        );
        assert_eq!(config.backend, BackendKind::Fb);
        assert!(config.disable_2d && config.force_2d && config.secure_overlay);
        assert!(!config.fake_vsync);
        assert_eq!(config.limitations(), Limitations::ALPHA_BLEND_ERRATUM);
    }

    #[test]
    fn keyword_modes() {
        let mode = boot(&[(ENV_DISPLAY_MODE, "4k")]).display_mode;
        assert_eq!(mode, Some(ModeRequest::size(4096, 2160)));
        assert_eq!(
            boot(&[(ENV_DISPLAY_MODE, "1280x720p60")]).display_mode,
            Some(ModeRequest::size(1280, 720).at(60))
        );
        assert!(boot(&[(ENV_DISPLAY_MODE, "preferred")]).display_mode.unwrap().preferred);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = boot(&[
            (ENV_DISPLAY_MODE, "huge"),
            (ENV_GUI_RESOLUTION, "ssw0x0"),
            (ENV_BACKEND, "vulkan"),
            (ENV_FAKE_VSYNC, "maybe"),
        ]);
        assert_eq!(config, BootConfig::default());
    }

    #[test]
    fn context_shares_services() {
        let engine = Arc::new(crate::backend::composer::engine::test::MockEngine::default());
        let composer = Arc::new(crate::backend::composer::test::composer(&engine));
        let context = ServiceContext::new(BootConfig::default(), None, composer.clone());
        let copy = context.clone();
        assert!(Arc::ptr_eq(copy.composer(), &composer));
        assert!(copy.allocator().is_none());
    }
}

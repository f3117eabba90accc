//! Per frame composition decisions
//!
//! [`verify_layers`] looks at all claimed layer slots of a display and decides for each
//! one who draws it: the client (before handing over its render target), the 2D engine
//! or a dedicated overlay plane. At most one layer is scanned out on an overlay plane
//! and that layer has to end up on top of every client composited layer.

use tracing::{debug, error, trace};

use crate::backend::{
    allocator::Usage,
    composer::{Composer, G2dFeature},
};

use super::layer::{BlendMode, Layer, LayerFlags, LayerType};

bitflags::bitflags! {
    /// Hardware limitations of a display pipeline
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Limitations: u32 {
        /// Blending a layer with a plane alpha below 255 corrupts the output
        const ALPHA_BLEND_ERRATUM = 0x1;
    }
}

/// How the overlay layer of a frame got selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayRule {
    /// First eligible layer in slot order
    First,
    /// A later layer of higher priority not covered by client layers
    Priority,
    /// A secure layer replacing a non-secure one regardless of paint order
    SecureOverride,
}

/// Inputs of [`verify_layers`] besides the layers
pub struct VerifyContext<'a> {
    /// Device composition engine
    pub composer: &'a Composer,
    /// Whether the backend can scan out a layer on an overlay plane
    pub check_overlay: &'a dyn Fn(&Layer) -> bool,
    /// Whether secure layers always win the overlay plane
    pub secure_overlay: bool,
    /// Hardware limitations
    pub limitations: Limitations,
}

impl std::fmt::Debug for VerifyContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyContext")
            .field("composer", &self.composer)
            .field("secure_overlay", &self.secure_overlay)
            .field("limitations", &self.limitations)
            .finish_non_exhaustive()
    }
}

/// Result of [`verify_layers`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the 2D engine composes this frame
    pub device_compose: bool,
    /// Slot indices of the layers to blit, in discovery order
    pub layers: Vec<usize>,
    /// Slot index of the overlay layer
    pub overlay: Option<usize>,
    /// Rule that selected the overlay layer
    pub overlay_rule: Option<OverlayRule>,
    /// Whether anything visible changed since the last frame
    pub ui_update: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FrameComposition {
    overlay: bool,
    client: bool,
    device: bool,
}

impl FrameComposition {
    fn all_overlay(&self) -> bool {
        self.overlay && !self.client && !self.device
    }
}

/// Composition history across frames
///
/// Tracks which kinds of composition the previous and the current frame used, to
/// detect the switch from client composition to pure overlay scan-out. Frames that
/// stay fully overlay-composited never touch the render target again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeHistory {
    last: FrameComposition,
    current: FrameComposition,
}

impl ComposeHistory {
    fn record(&mut self, current: FrameComposition) {
        self.last = self.current;
        self.current = current;
    }

    /// Whether this frame scans out a layer on the overlay plane
    pub fn has_overlay(&self) -> bool {
        self.current.overlay
    }

    /// Whether this frame has client composited layers
    pub fn has_client(&self) -> bool {
        self.current.client
    }

    /// Whether the frame switched from client composition to pure overlay scan-out
    ///
    /// The render target has to be cleared then or the last client image stays visible
    /// below the overlay. The opposite switch hands over a target the client just drew.
    pub fn needs_target_clear(&self) -> bool {
        self.last.client && self.current.all_overlay()
    }
}

/// Whether the 2D engine is able to compose every claimed layer
pub fn check_2d_composition(layers: &[Layer], composer: &Composer, limitations: Limitations) -> bool {
    if !composer.is_valid() || composer.is_disabled() {
        return false;
    }

    let busy = layers.iter().filter(|layer| layer.busy);
    if busy.clone().any(|layer| layer.flags.contains(LayerFlags::BUFFER_SLOT)) {
        // hardware-fed layers are only ever presented through the engine
        return true;
    }
    if composer.is_2d_forced() {
        return true;
    }

    let rotation = composer.is_feature_supported(G2dFeature::Rotation);
    for layer in busy {
        if !layer.transform.is_empty() && !rotation {
            debug!(layer = layer.index, "2D engine can't rotate");
            return false;
        }
        if let Some(handle) = &layer.handle {
            if handle.format().is_tiled() && !composer.can_read(handle.format()) {
                debug!(layer = layer.index, format = ?handle.format(), "2D engine can't read tiled format");
                return false;
            }
        }
        if limitations.contains(Limitations::ALPHA_BLEND_ERRATUM)
            && layer.blend_mode != BlendMode::None
            && layer.plane_alpha < 0xff
        {
            debug!(layer = layer.index, alpha = layer.plane_alpha, "alpha blending erratum");
            return false;
        }
    }
    true
}

fn overlay_priority(layer: &Layer) -> (bool, Usage) {
    let usage = layer.handle.as_ref().map(|h| h.usage()).unwrap_or_default();
    (layer.is_secure(), usage)
}

fn outranks(candidate: &Layer, current: &Layer) -> bool {
    let (secure, usage) = overlay_priority(candidate);
    let (current_secure, current_usage) = overlay_priority(current);
    (secure, usage.bits()) > (current_secure, current_usage.bits())
}

/// Pick the layer to scan out on the overlay plane
fn select_overlay(
    layers: &[Layer],
    device_compose: bool,
    ctx: &VerifyContext<'_>,
) -> Option<(usize, OverlayRule)> {
    let client_above = |zorder: u32, except: usize| {
        layers
            .iter()
            .any(|l| l.busy && l.index != except && l.type_ == LayerType::Client && l.zorder > zorder)
    };

    let mut selected: Option<(usize, OverlayRule)> = None;
    for layer in layers.iter().filter(|l| l.busy) {
        if layer.flags.contains(LayerFlags::SKIP_LAYER) || layer.type_ == LayerType::Client {
            continue;
        }
        if !(ctx.check_overlay)(layer) {
            continue;
        }
        match selected {
            None if ctx.secure_overlay && layer.is_secure() => {
                selected = Some((layer.index, OverlayRule::SecureOverride))
            }
            None => selected = Some((layer.index, OverlayRule::First)),
            Some((current, _)) => {
                let current = &layers[current];
                if ctx.secure_overlay && layer.is_secure() && !current.is_secure() {
                    trace!(layer = layer.index, replaced = current.index, "secure overlay override");
                    selected = Some((layer.index, OverlayRule::SecureOverride));
                } else if outranks(layer, current) && !client_above(layer.zorder, layer.index) {
                    trace!(layer = layer.index, replaced = current.index, "overlay replaced");
                    selected = Some((layer.index, OverlayRule::Priority));
                }
            }
        }
    }

    let (index, rule) = selected?;
    if rule == OverlayRule::SecureOverride {
        return selected;
    }

    // every other layer drawn by the client has to be below the overlay
    let overlay = &layers[index];
    let covered = layers.iter().any(|l| {
        l.busy
            && l.index != index
            && l.zorder > overlay.zorder
            && (l.type_ == LayerType::Client || (!device_compose && !l.source_crop.is_zero()))
    });
    if covered {
        debug!(layer = index, "overlay rejected, client layer on top");
        return None;
    }
    selected
}

/// Decide the composition of every claimed layer
///
/// Sets the resolved type and the overlay flag of every claimed layer and refreshes
/// their change tracking.
#[profiling::function]
pub fn verify_layers(layers: &mut [Layer], ctx: &VerifyContext<'_>, history: &mut ComposeHistory) -> Verdict {
    let mut verdict = Verdict {
        device_compose: check_2d_composition(layers, ctx.composer, ctx.limitations),
        ..Default::default()
    };

    for layer in layers.iter_mut().filter(|l| l.busy) {
        layer.is_overlay = false;
        if layer.flags.contains(LayerFlags::SKIP_LAYER) {
            layer.type_ = LayerType::Client;
            verdict.device_compose = false;
            continue;
        }
        match layer.orig_type {
            LayerType::Client => {
                layer.type_ = LayerType::Client;
                verdict.device_compose = false;
            }
            LayerType::SolidColor => {
                layer.blend_mode = BlendMode::Dim;
                layer.type_ = LayerType::SolidColor;
            }
            LayerType::Sideband | LayerType::Device | LayerType::Cursor => {
                layer.type_ = LayerType::Device;
            }
            LayerType::Invalid => {
                error!(layer = layer.index, "unrecognized layer type");
                layer.type_ = LayerType::Client;
                verdict.device_compose = false;
            }
        }
    }

    let composer_valid = ctx.composer.is_valid();
    if !composer_valid {
        verdict.device_compose = false;
    } else if let Some((index, rule)) = select_overlay(layers, verdict.device_compose, ctx) {
        verdict.overlay = Some(index);
        verdict.overlay_rule = Some(rule);
    }

    let mut frame = FrameComposition {
        overlay: verdict.overlay.is_some(),
        ..Default::default()
    };
    for layer in layers.iter_mut().filter(|l| l.busy) {
        if Some(layer.index) == verdict.overlay {
            layer.is_overlay = true;
            layer.type_ = LayerType::Device;
            verdict.ui_update |= layer.take_update();
            continue;
        }

        verdict.ui_update |= layer.take_update();
        if frame.overlay && layer.source_crop.is_zero() {
            // background fill below a video overlay, nothing to draw
            layer.type_ = LayerType::Device;
            continue;
        }
        if !verdict.device_compose {
            layer.type_ = LayerType::Client;
            frame.client = true;
            continue;
        }
        frame.device = true;
        verdict.layers.push(layer.index);
    }

    history.record(frame);
    trace!(
        device = verdict.device_compose,
        layers = verdict.layers.len(),
        overlay = ?verdict.overlay,
        ui_update = verdict.ui_update,
        "layers verified"
    );
    verdict
}

/// Capability flags, fixed when the binding layout is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderConfig {
    /// Count rays per pixel into a statistics image and report rays per second.
    pub report_ray_stats: bool,
    /// Accumulate color, albedo and normal for a denoiser, then tonemap.
    pub denoise: bool,
    /// Frames are presented directly, so readback only happens on request.
    pub display_surface: bool,
}

impl RenderConfig {
    pub fn readback_required(&self, requested: bool) -> bool {
        requested || !self.display_surface || self.report_ray_stats
    }

    /// Bytes per pixel of the accumulation buffer.
    pub fn accum_pixel_size(&self) -> usize {
        if self.denoise {
            48
        } else {
            16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readback_conditions() {
        let headless = RenderConfig::default();
        assert!(headless.readback_required(false));

        let display = RenderConfig {
            display_surface: true,
            ..Default::default()
        };
        assert!(!display.readback_required(false));
        assert!(display.readback_required(true));

        let stats = RenderConfig {
            display_surface: true,
            report_ray_stats: true,
            ..Default::default()
        };
        assert!(stats.readback_required(false));
    }
}

use std::time::Duration;

use bitflags::bitflags;
use log::{info, warn};
use serde::{Deserialize, Serialize};

const MAX_FRAMES_IN_FLIGHT: u32 = 4;
const MAX_PCF_SAMPLES: u32 = 16;
pub const MAX_SSAO_SAMPLES: u32 = 64;

bitflags! {
    /// Debug views composed by the post-process pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DebugOverlays: u32 {
        /// Show the blurred occlusion factor instead of the lit image.
        const AMBIENT_OCCLUSION = 1 << 0;
        /// Show prepass view-space normals.
        const NORMALS = 1 << 1;
        /// Tint fragments by the directional shadow cascade they sample.
        const SHADOW_CASCADES = 1 << 2;
    }
}

impl Default for DebugOverlays {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "RenderSettings::default_ambient_strength")]
    pub ambient_strength: f32,
    #[serde(default = "RenderSettings::default_shadow_pcf_samples")]
    pub shadow_pcf_samples: u32,
    #[serde(default = "RenderSettings::default_frames_in_flight")]
    pub frames_in_flight: u32,
    #[serde(default = "RenderSettings::default_true")]
    pub depth_prepass: bool,
    #[serde(default)]
    pub ssao: SsaoSettings,
    #[serde(default = "RenderSettings::default_shadow_map_size")]
    pub shadow_map_size: u32,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "RenderSettings::default_gamma")]
    pub gamma: f32,
    #[serde(default)]
    pub debug_overlays: DebugOverlays,
    #[serde(default = "RenderSettings::default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
    #[serde(default)]
    pub material_buffers: MaterialBufferSettings,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            ambient_strength: Self::default_ambient_strength(),
            shadow_pcf_samples: Self::default_shadow_pcf_samples(),
            frames_in_flight: Self::default_frames_in_flight(),
            depth_prepass: true,
            ssao: SsaoSettings::default(),
            shadow_map_size: Self::default_shadow_map_size(),
            resolution: Resolution::default(),
            gamma: Self::default_gamma(),
            debug_overlays: DebugOverlays::empty(),
            fence_timeout_ms: Self::default_fence_timeout_ms(),
            material_buffers: MaterialBufferSettings::default(),
        }
    }
}

impl RenderSettings {
    pub fn load() -> Self {
        Self::load_from_path("render_settings.json")
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RenderSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    /// Replaces out-of-range values with defaults and resolves feature
    /// combinations the pass sequence cannot run.
    pub fn validate(mut self) -> Self {
        if !self.ambient_strength.is_finite() || self.ambient_strength < 0.0 {
            warn!("Ambient strength must be a non-negative number. Using default value.");
            self.ambient_strength = Self::default_ambient_strength();
        }

        if self.shadow_pcf_samples == 0 || self.shadow_pcf_samples > MAX_PCF_SAMPLES {
            warn!(
                "Shadow PCF sample count must be in 1..={}. Using default value.",
                MAX_PCF_SAMPLES
            );
            self.shadow_pcf_samples = Self::default_shadow_pcf_samples();
        }

        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            warn!(
                "Frames in flight must be in 1..={}. Using default value.",
                MAX_FRAMES_IN_FLIGHT
            );
            self.frames_in_flight = Self::default_frames_in_flight();
        }

        if self.shadow_map_size == 0 {
            warn!("Shadow map size must be greater than zero. Using default value.");
            self.shadow_map_size = Self::default_shadow_map_size();
        }

        if self.resolution.width == 0 || self.resolution.height == 0 {
            warn!("Resolution must be greater than zero. Using default resolution.");
            self.resolution = Resolution::default();
        }

        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            warn!("Gamma must be positive. Using default value.");
            self.gamma = Self::default_gamma();
        }

        if self.fence_timeout_ms == 0 {
            warn!("Fence timeout must be greater than zero. Using default value.");
            self.fence_timeout_ms = Self::default_fence_timeout_ms();
        }

        self.ssao = self.ssao.validate();
        if self.ssao.enabled && !self.depth_prepass {
            warn!("SSAO needs the depth prepass. Disabling SSAO.");
            self.ssao.enabled = false;
        }

        self.material_buffers = self.material_buffers.validate();
        self
    }

    pub fn ssao_active(&self) -> bool {
        self.depth_prepass && self.ssao.enabled
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    const fn default_ambient_strength() -> f32 {
        0.1
    }

    const fn default_shadow_pcf_samples() -> u32 {
        4
    }

    const fn default_frames_in_flight() -> u32 {
        2
    }

    const fn default_true() -> bool {
        true
    }

    const fn default_shadow_map_size() -> u32 {
        2048
    }

    const fn default_gamma() -> f32 {
        2.2
    }

    const fn default_fence_timeout_ms() -> u64 {
        1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SsaoSettings {
    #[serde(default = "SsaoSettings::default_enabled")]
    pub enabled: bool,
    #[serde(default = "SsaoSettings::default_sample_count")]
    pub sample_count: u32,
    #[serde(default = "SsaoSettings::default_radius")]
    pub radius: f32,
    #[serde(default = "SsaoSettings::default_bias")]
    pub bias: f32,
    #[serde(default = "SsaoSettings::default_enabled")]
    pub blur: bool,
}

impl Default for SsaoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_count: Self::default_sample_count(),
            radius: Self::default_radius(),
            bias: Self::default_bias(),
            blur: true,
        }
    }
}

impl SsaoSettings {
    fn validate(mut self) -> Self {
        if self.sample_count == 0 || self.sample_count > MAX_SSAO_SAMPLES {
            warn!(
                "SSAO sample count must be in 1..={}. Using default value.",
                MAX_SSAO_SAMPLES
            );
            self.sample_count = Self::default_sample_count();
        }
        if !(self.radius > 0.0) {
            warn!("SSAO radius must be positive. Using default value.");
            self.radius = Self::default_radius();
        }
        if !(self.bias >= 0.0) {
            warn!("SSAO bias must be non-negative. Using default value.");
            self.bias = Self::default_bias();
        }
        self
    }

    const fn default_enabled() -> bool {
        true
    }

    const fn default_sample_count() -> u32 {
        16
    }

    const fn default_radius() -> f32 {
        0.2
    }

    const fn default_bias() -> f32 {
        0.05
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialBufferSettings {
    #[serde(default = "MaterialBufferSettings::default_initial_capacity")]
    pub initial_capacity: u32,
    #[serde(default = "MaterialBufferSettings::default_max_capacity")]
    pub max_capacity: u32,
}

impl Default for MaterialBufferSettings {
    fn default() -> Self {
        Self {
            initial_capacity: Self::default_initial_capacity(),
            max_capacity: Self::default_max_capacity(),
        }
    }
}

impl MaterialBufferSettings {
    fn validate(mut self) -> Self {
        if self.initial_capacity == 0 {
            warn!("Material buffer capacity must be greater than zero. Using default value.");
            self.initial_capacity = Self::default_initial_capacity();
        }
        if self.max_capacity < self.initial_capacity {
            warn!(
                "Material buffer max capacity {} is below the initial capacity {}. Clamping.",
                self.max_capacity, self.initial_capacity
            );
            self.max_capacity = self.initial_capacity;
        }
        self
    }

    const fn default_initial_capacity() -> u32 {
        64
    }

    const fn default_max_capacity() -> u32 {
        1 << 16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

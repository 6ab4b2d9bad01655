use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Shadow map budget of a light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl ShadowQuality {
    /// Shadow map edge length for a configured base size.
    pub fn map_size(self, base: u32) -> u32 {
        let size = match self {
            Self::Low => base / 4,
            Self::Medium => base / 2,
            Self::High => base,
        };
        size.max(64)
    }

    /// Directional cascade count.
    pub fn cascade_count(self) -> usize {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Directional {
        direction: Vec3,
    },
    Spot {
        position: Vec3,
        direction: Vec3,
        range: f32,
        inner_angle: f32,
        outer_angle: f32,
    },
    Point {
        position: Vec3,
        range: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    pub casts_shadows: bool,
    pub shadow_quality: ShadowQuality,
}

impl Light {
    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self::new(LightKind::Directional {
            direction: direction.try_normalize().unwrap_or(Vec3::NEG_Y),
        })
        .with_color(color, intensity)
    }

    pub fn point(position: Vec3, range: f32, color: Vec3, intensity: f32) -> Self {
        Self::new(LightKind::Point { position, range }).with_color(color, intensity)
    }

    pub fn spot(
        position: Vec3,
        direction: Vec3,
        range: f32,
        inner_angle: f32,
        outer_angle: f32,
    ) -> Self {
        let (inner_angle, outer_angle) = if inner_angle > outer_angle {
            (outer_angle, inner_angle)
        } else {
            (inner_angle, outer_angle)
        };
        Self::new(LightKind::Spot {
            position,
            direction: direction.try_normalize().unwrap_or(Vec3::NEG_Y),
            range,
            inner_angle,
            outer_angle,
        })
    }

    fn new(kind: LightKind) -> Self {
        Self {
            kind,
            color: Vec3::ONE,
            intensity: 1.0,
            casts_shadows: false,
            shadow_quality: ShadowQuality::default(),
        }
    }

    pub fn with_color(mut self, color: Vec3, intensity: f32) -> Self {
        self.color = color;
        self.intensity = intensity;
        self
    }

    pub fn with_shadows(mut self, quality: ShadowQuality) -> Self {
        self.casts_shadows = true;
        self.shadow_quality = quality;
        self
    }

    /// Depth layers one shadow map of this light needs.
    pub fn shadow_layers(&self) -> usize {
        match self.kind {
            LightKind::Directional { .. } => self.shadow_quality.cascade_count(),
            LightKind::Spot { .. } => 1,
            LightKind::Point { .. } => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_angles_are_ordered() {
        let light = Light::spot(Vec3::ZERO, Vec3::NEG_Z, 10.0, 0.8, 0.3);
        let LightKind::Spot {
            inner_angle,
            outer_angle,
            ..
        } = light.kind
        else {
            panic!("expected spot light");
        };
        assert!(inner_angle < outer_angle);
    }

    #[test]
    fn quality_tiers_scale_maps_and_cascades() {
        assert_eq!(ShadowQuality::High.map_size(2048), 2048);
        assert_eq!(ShadowQuality::Low.map_size(2048), 512);
        assert_eq!(ShadowQuality::Low.map_size(128), 64);

        let sun = Light::directional(Vec3::NEG_Y, Vec3::ONE, 1.0).with_shadows(ShadowQuality::High);
        assert_eq!(sun.shadow_layers(), 4);
        let bulb = Light::point(Vec3::ZERO, 5.0, Vec3::ONE, 1.0);
        assert!(!bulb.casts_shadows);
        assert_eq!(bulb.shadow_layers(), 6);
    }
}

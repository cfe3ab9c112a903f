//! Derived image computer.
//!
//! Turns raw frames into the images people actually look at:
//!
//! - **Absorption** (fast-kinetics runs): per species, a shadow, a light and a
//!   dark frame give the optical density
//!   `ln((light - dark) / (shadow - dark)) + (light - shadow) / C_sat`.
//!   Non-finite pixels become 0. Pixels above the OD ceiling are clamped to
//!   the ceiling. Nothing is clamped on the low side.
//! - **Fluorescence** (single-frame runs): `signal - dark`.
//!
//! Species are kinetic indices; roles are shot indices. The role mapping can
//! be changed after the acquisition and the images recomputed from the same
//! [`RawFrameSet`].

use super::assembler::RawFrameSet;
use crate::config::ImagingSettings;
use crate::error::{CamError, CamResult};
use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

/// Which derivation applies to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationMode {
    /// Optical density from shadow, light and dark frames.
    Absorption,
    /// Background-subtracted signal.
    Fluorescence,
}

impl DerivationMode {
    /// Short tag used in file names.
    pub fn suffix(self) -> &'static str {
        match self {
            DerivationMode::Absorption => "od",
            DerivationMode::Fluorescence => "sub",
        }
    }
}

/// Shot indices playing each absorption role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsorptionRoles {
    /// Atoms in the beam.
    pub shadow: usize,
    /// Beam without atoms.
    pub light: usize,
    /// No beam.
    pub dark: usize,
}

impl Default for AbsorptionRoles {
    fn default() -> Self {
        Self {
            shadow: 0,
            light: 1,
            dark: 2,
        }
    }
}

/// Shot indices playing each fluorescence role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FluorescenceRoles {
    /// Fluorescence signal.
    pub signal: usize,
    /// Background.
    pub dark: usize,
}

impl Default for FluorescenceRoles {
    fn default() -> Self {
        Self { signal: 0, dark: 1 }
    }
}

/// Role mapping for both derivation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameRoles {
    /// Used for absorption runs.
    #[serde(default)]
    pub absorption: AbsorptionRoles,
    /// Used for fluorescence runs.
    #[serde(default)]
    pub fluorescence: FluorescenceRoles,
}

impl FrameRoles {
    /// Highest shot index the mapping for `mode` refers to.
    pub fn max_shot(&self, mode: DerivationMode) -> usize {
        match mode {
            DerivationMode::Absorption => {
                let r = self.absorption;
                r.shadow.max(r.light).max(r.dark)
            }
            DerivationMode::Fluorescence => self.fluorescence.signal.max(self.fluorescence.dark),
        }
    }
}

/// One derived image.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFrame {
    /// Species slot (kinetic index).
    pub species: usize,
    /// Pixel values.
    pub image: Array2<f64>,
}

/// Derived images of one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedImages {
    /// Derivation used.
    pub mode: DerivationMode,
    /// Roles the images were computed with.
    pub roles: FrameRoles,
    /// One image per species slot.
    pub frames: Vec<DerivedFrame>,
}

fn check_shapes(views: &[ArrayView2<'_, i32>]) -> CamResult<()> {
    let Some(first) = views.first() else {
        return Ok(());
    };
    if views.iter().any(|v| v.dim() != first.dim()) {
        let dims: Vec<String> = views
            .iter()
            .map(|v| format!("{}x{}", v.nrows(), v.ncols()))
            .collect();
        return Err(CamError::Shape(format!(
            "derived image inputs differ in shape: {}",
            dims.join(", ")
        )));
    }
    Ok(())
}

/// Optical density of one species.
pub fn optical_density(
    shadow: ArrayView2<'_, i32>,
    light: ArrayView2<'_, i32>,
    dark: ArrayView2<'_, i32>,
    saturation_counts: f64,
    od_max: f64,
) -> CamResult<Array2<f64>> {
    check_shapes(&[shadow.view(), light.view(), dark.view()])?;
    let mut od = Array2::<f64>::zeros(shadow.dim());
    Zip::from(&mut od)
        .and(&shadow)
        .and(&light)
        .and(&dark)
        .for_each(|out, &s, &l, &d| {
            let (s, l, d) = (f64::from(s), f64::from(l), f64::from(d));
            let value = ((l - d) / (s - d)).ln() + (l - s) / saturation_counts;
            *out = if value.is_finite() {
                value.min(od_max)
            } else {
                0.0
            };
        });
    Ok(od)
}

/// Background-subtracted fluorescence of one species.
pub fn fluorescence(
    signal: ArrayView2<'_, i32>,
    dark: ArrayView2<'_, i32>,
) -> CamResult<Array2<f64>> {
    check_shapes(&[signal.view(), dark.view()])?;
    let mut sub = Array2::<f64>::zeros(signal.dim());
    Zip::from(&mut sub)
        .and(&signal)
        .and(&dark)
        .for_each(|out, &sig, &bg| *out = f64::from(sig) - f64::from(bg));
    Ok(sub)
}

/// Computes derived images with fixed imaging constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedImageComputer {
    saturation_counts: f64,
    od_max: f64,
    species_slots: usize,
}

impl DerivedImageComputer {
    /// Computer using the configured constants.
    pub fn new(settings: &ImagingSettings) -> Self {
        Self {
            saturation_counts: settings.saturation_counts,
            od_max: settings.od_max,
            species_slots: settings.species_slots,
        }
    }

    /// Derived images for every species slot present in `frames`.
    ///
    /// Fails with a [`CamError::Config`] when the roles refer to shots the run
    /// did not collect.
    pub fn compute(
        &self,
        frames: &RawFrameSet,
        mode: DerivationMode,
        roles: FrameRoles,
    ) -> CamResult<DerivedImages> {
        let needed = roles.max_shot(mode) + 1;
        if frames.shot_count() < needed {
            return Err(CamError::Config(format!(
                "{mode:?} roles need {needed} shots, only {} were acquired",
                frames.shot_count()
            )));
        }

        let species = frames.kinetic_count().min(self.species_slots);
        let mut out = Vec::with_capacity(species);
        for k in 0..species {
            let image = match mode {
                DerivationMode::Absorption => {
                    let r = roles.absorption;
                    optical_density(
                        shot(frames, r.shadow, k)?,
                        shot(frames, r.light, k)?,
                        shot(frames, r.dark, k)?,
                        self.saturation_counts,
                        self.od_max,
                    )?
                }
                DerivationMode::Fluorescence => {
                    let r = roles.fluorescence;
                    fluorescence(shot(frames, r.signal, k)?, shot(frames, r.dark, k)?)?
                }
            };
            out.push(DerivedFrame { species: k, image });
        }

        Ok(DerivedImages {
            mode,
            roles,
            frames: out,
        })
    }
}

fn shot(frames: &RawFrameSet, shot: usize, kinetic: usize) -> CamResult<ArrayView2<'_, i32>> {
    frames.frame(shot, kinetic).ok_or_else(|| {
        CamError::Shape(format!("no frame for shot {shot}, kinetic index {kinetic}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn imaging() -> ImagingSettings {
        ImagingSettings {
            od_max: 10.0,
            saturation_counts: 2200.0,
            species_slots: 2,
        }
    }

    #[test]
    fn equal_light_and_shadow_gives_zero() {
        let od = optical_density(
            array![[100]].view(),
            array![[100]].view(),
            array![[0]].view(),
            2200.0,
            10.0,
        )
        .unwrap();
        assert_eq!(od[[0, 0]], 0.0);
    }

    #[test]
    fn division_by_zero_becomes_zero() {
        let od = optical_density(
            array![[0]].view(),
            array![[50]].view(),
            array![[0]].view(),
            2200.0,
            10.0,
        )
        .unwrap();
        assert_eq!(od[[0, 0]], 0.0);
    }

    #[test]
    fn negative_ratio_becomes_zero() {
        let od = optical_density(
            array![[-10]].view(),
            array![[50]].view(),
            array![[0]].view(),
            2200.0,
            10.0,
        )
        .unwrap();
        assert_eq!(od[[0, 0]], 0.0);
    }

    #[test]
    fn high_values_clamp_to_ceiling() {
        // ln(101) + (151 - 51) / 2 is about 54.6
        let od = optical_density(
            array![[51]].view(),
            array![[151]].view(),
            array![[50]].view(),
            2.0,
            10.0,
        )
        .unwrap();
        assert_eq!(od[[0, 0]], 10.0);
    }

    #[test]
    fn low_side_is_not_clamped() {
        let od = optical_density(
            array![[200]].view(),
            array![[100]].view(),
            array![[0]].view(),
            2200.0,
            10.0,
        )
        .unwrap();
        let expected = (0.5f64).ln() - 100.0 / 2200.0;
        assert!((od[[0, 0]] - expected).abs() < 1e-12);
        assert!(od[[0, 0]] < 0.0);
    }

    #[test]
    fn fluorescence_subtracts_dark() {
        let sub = fluorescence(array![[10, 20]].view(), array![[3, 25]].view()).unwrap();
        assert_eq!(sub, array![[7.0, -5.0]]);
    }

    #[test]
    fn mismatched_inputs_are_shape_errors() {
        let err = fluorescence(array![[1, 2]].view(), array![[1]].view()).unwrap_err();
        assert!(matches!(err, CamError::Shape(_)));
    }

    #[test]
    fn inputs_from_separate_owners_are_checked_together() {
        let shadow = array![[100, 100]];
        let light = array![[100, 100]];
        let od = {
            let dark = array![[0, 0]];
            optical_density(shadow.view(), light.view(), dark.view(), 2200.0, 10.0).unwrap()
        };
        assert_eq!(od, array![[0.0, 0.0]]);

        let short_dark = array![[0]];
        let err = optical_density(shadow.view(), light.view(), short_dark.view(), 2200.0, 10.0)
            .unwrap_err();
        assert!(matches!(err, CamError::Shape(_)));
    }

    #[test]
    fn compute_per_species_and_remap() {
        // Two species (kinetic indices), three shots: shadow, light, dark.
        let mut set = RawFrameSet::new();
        set.push_shot(vec![array![[50]], array![[25]]]).unwrap();
        set.push_shot(vec![array![[100]], array![[100]]]).unwrap();
        set.push_shot(vec![array![[0]], array![[0]]]).unwrap();

        let computer = DerivedImageComputer::new(&imaging());
        let images = computer
            .compute(&set, DerivationMode::Absorption, FrameRoles::default())
            .unwrap();
        assert_eq!(images.frames.len(), 2);
        let k = (2.0f64).ln() + 50.0 / 2200.0;
        assert!((images.frames[0].image[[0, 0]] - k).abs() < 1e-12);
        assert_eq!(images.frames[1].species, 1);

        // Swap shadow and light.
        let swapped = FrameRoles {
            absorption: AbsorptionRoles {
                shadow: 1,
                light: 0,
                dark: 2,
            },
            ..FrameRoles::default()
        };
        let images = computer
            .compute(&set, DerivationMode::Absorption, swapped)
            .unwrap();
        assert!((images.frames[0].image[[0, 0]] + k).abs() < 1e-12);
    }

    #[test]
    fn species_are_capped_by_slots() {
        let mut set = RawFrameSet::new();
        for v in [5, 1] {
            set.push_shot(vec![array![[v]], array![[v]], array![[v]]]).unwrap();
        }
        let computer = DerivedImageComputer::new(&imaging());
        let images = computer
            .compute(&set, DerivationMode::Fluorescence, FrameRoles::default())
            .unwrap();
        assert_eq!(images.frames.len(), 2);
        assert_eq!(images.frames[0].image[[0, 0]], 4.0);
    }

    #[test]
    fn roles_beyond_collected_shots_are_rejected() {
        let mut set = RawFrameSet::new();
        set.push_shot(vec![array![[1]]]).unwrap();
        let computer = DerivedImageComputer::new(&imaging());
        let err = computer
            .compute(&set, DerivationMode::Absorption, FrameRoles::default())
            .unwrap_err();
        assert!(matches!(err, CamError::Config(_)));
    }
}

//! Frame pipeline: raw buffer assembly and derived images.

pub mod assembler;
pub mod derived;

pub use assembler::{append_shot, flatten, reshape, RawFrameSet};
pub use derived::{
    fluorescence, optical_density, AbsorptionRoles, DerivationMode, DerivedFrame,
    DerivedImageComputer, DerivedImages, FluorescenceRoles, FrameRoles,
};

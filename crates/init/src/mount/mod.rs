//! Mount/device manager: LUN resolution, filesystem detection, mount-option
//! parsing, overlay construction, and detach. Grounded on
//! `mountutil.c`/`mountutil.h`/`mountflags.cpp` (option parsing, mountinfo)
//! and `main.cpp` (LUN/device/partition/detach routines).

pub mod device;
pub mod flags;
pub mod mountinfo;
pub mod overlay;

pub use device::{DeviceError, MountStep};

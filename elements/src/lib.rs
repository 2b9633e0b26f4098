// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod astro_util;
pub mod camera_trait;
pub mod coords;
pub mod errors;
pub mod mount_trait;
pub mod solver_trait;

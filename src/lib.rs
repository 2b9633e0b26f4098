// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod config;
pub mod correction_loop;
pub mod image_file_camera;
pub mod lx200_mount;
pub mod nova;
pub mod session;
pub mod simulator;
pub mod solve_field;

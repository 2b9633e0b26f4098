// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use async_trait::async_trait;

use crate::camera_trait::CapturedImage;
use crate::coords::EquatorialPosition;
use crate::errors::SolveError;

// Either a full solution or the reason there is none.
#[derive(Clone, Debug, PartialEq)]
pub enum SolveResult {
    Solved {
        // Center of the image.
        position: EquatorialPosition,
        // 0..1. Solvers without a match quality report 1.0 for any verified
        // solution.
        confidence: f64,
    },
    Failed { reason: SolveError },
}

impl SolveResult {
    pub fn failed(reason: SolveError) -> Self {
        SolveResult::Failed{reason}
    }
}

// If SolveResult::Solved is not returned, the reason is one of:
//   NoMatch: the solver ran but found no match.
//   Timeout: `timeout` was reached. The solver abandons its work in this case.
//   MalformedResult: the solver's output could not be interpreted.
//   Unavailable: the solver could not be reached or started.
#[async_trait]
pub trait PlateSolver: Send + Sync {
    // Note: this can take from well under a second (local, with a good scale
    // hint) to minutes (remote service queue).
    async fn solve(&self, image: &CapturedImage, timeout: Duration)
                   -> SolveResult;

    // Short name for logging.
    fn name(&self) -> &str;
}

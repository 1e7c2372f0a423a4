//! Integration test suite for cascade.
//!
//! These tests exercise the engine end to end: planning, workspace
//! isolation, parallel session execution, merging, failure handling,
//! and crash recovery. Worker processes are shell-script stand-ins, so
//! the suite runs anywhere with /bin/sh and git.

mod fixtures;

mod workflow_e2e;
mod parallel_waves;
mod conflict_and_skip;
mod recovery;

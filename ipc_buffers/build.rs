//! Build script for the self-test runner.
//!
//! Responsible for emitting build information for the startup banner.

use vergen::{BuildBuilder, CargoBuilder, Emitter};

fn emit_info() {
    let build = BuildBuilder::default()
        .build_timestamp(true)
        .build()
        .unwrap();
    let cargo = CargoBuilder::default()
        .target_triple(true)
        .debug(true)
        .build()
        .unwrap();
    Emitter::default()
        .add_instructions(&build)
        .unwrap()
        .add_instructions(&cargo)
        .unwrap()
        .emit()
        .unwrap()
}

fn main() {
    emit_info();
}

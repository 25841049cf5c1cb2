//! Build script for the stagehand control plane.
//!
//! Ensures the project is recompiled when migration files change, which is
//! necessary for the `SQLx` `migrate!()` macro to pick up new migrations.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}

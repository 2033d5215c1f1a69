// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Flutware

// Build script for the native installer bridge
// Ensures proper linking on Android

fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "android" {
        // android_logger writes through liblog
        println!("cargo:rustc-link-lib=log");
    }
}

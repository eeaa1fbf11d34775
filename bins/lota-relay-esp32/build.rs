//! Build script for the LOTA ESP32 relay
//!
//! This script sets up the ESP-IDF environment variables needed for compilation.

fn main() {
    // Required for esp-idf-svc to find the IDF toolchain
    embuild::espidf::sysenv::output();
}

fn main() -> anyhow::Result<()> {
    // Host builds (tests, clippy) have no ESP-IDF environment to export.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();

        // Add crash log helper for better panic diagnostics
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    // The OTA page is embedded with include_str!
    println!("cargo:rerun-if-changed=src/templates/ota.html");
    Ok(())
}

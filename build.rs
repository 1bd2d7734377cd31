use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    // Add crash log helper for better panic diagnostics
    println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");

    emit_access_point_credentials()?;
    embed_trust_anchor()?;

    Ok(())
}

/// Read soft-AP credentials from softap_config.h if present
fn emit_access_point_credentials() -> anyhow::Result<()> {
    let config_path = "softap_config.h";
    println!("cargo:rerun-if-changed={}", config_path);

    let mut ssid = String::from("YOLO");
    let mut password = String::from("12345678");

    if Path::new(config_path).exists() {
        let contents = fs::read_to_string(config_path)?;

        if let Some(value) = define_value(&contents, "AP_SSID") {
            ssid = value.to_string();
        }
        if let Some(value) = define_value(&contents, "AP_PASSWORD") {
            password = value.to_string();
        }
    } else {
        println!("cargo:warning=softap_config.h not found, using the default YOLO access point");
    }

    println!("cargo:rustc-env=AP_SSID={}", ssid);
    println!("cargo:rustc-env=AP_PASSWORD={}", password);
    Ok(())
}

fn define_value<'a>(contents: &'a str, name: &str) -> Option<&'a str> {
    let directive = format!("#define {}", name);
    contents
        .lines()
        .find(|l| l.trim_start().starts_with(&directive))
        .and_then(|l| l.split('"').nth(1))
}

/// Copy the server certificate into OUT_DIR with a trailing NUL so the
/// firmware can hand it to ESP-TLS as a C string
fn embed_trust_anchor() -> anyhow::Result<()> {
    println!("cargo:rerun-if-env-changed=HOTKEY_CERT");
    let cert_path = env::var("HOTKEY_CERT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("certs/firmware.crt"));
    println!("cargo:rerun-if-changed={}", cert_path.display());

    let mut pem = if cert_path.exists() {
        fs::read(&cert_path)?
    } else {
        println!(
            "cargo:warning={} not found! Startup aborts at boot without a trust anchor.",
            cert_path.display()
        );
        Vec::new()
    };
    pem.retain(|b| *b != 0);
    pem.push(0);

    let out = PathBuf::from(env::var("OUT_DIR")?).join("firmware.crt");
    fs::write(out, pem)?;
    Ok(())
}

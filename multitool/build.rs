//! Build script for compile-time configuration injection.
//!
//! Set environment variables before building to bake in defaults. Anything
//! saved at runtime (provisioning portal, settings API) overrides them.
//!
//!   MULTITOOL_SSID=MyWiFi \
//!   MULTITOOL_PASSWORD=secret123 \
//!   MULTITOOL_ADMIN_USER=admin \
//!   MULTITOOL_ADMIN_PASSWORD=changeme1 \
//!   MULTITOOL_OTA_PASSWORD=changeme2 \
//!   MULTITOOL_MQTT_HOST=192.168.1.20 \
//!   MULTITOOL_MQTT_PORT=1883 \
//!   cargo build --release

const VARS: [&str; 7] = [
    "MULTITOOL_SSID",
    "MULTITOOL_PASSWORD",
    "MULTITOOL_ADMIN_USER",
    "MULTITOOL_ADMIN_PASSWORD",
    "MULTITOOL_OTA_PASSWORD",
    "MULTITOOL_MQTT_HOST",
    "MULTITOOL_MQTT_PORT",
];

/// Civil date for a count of days since 1970-01-01.
fn civil_date(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn main() {
    // Reproducible builds pin the date through SOURCE_DATE_EPOCH
    println!("cargo::rerun-if-env-changed=SOURCE_DATE_EPOCH");
    let secs = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.as_secs() as i64)
        });
    let (year, month, day) = civil_date(secs.div_euclid(86_400));
    println!("cargo::rustc-env=MULTITOOL_BUILD={year:04}-{month:02}-{day:02}");

    for var in VARS {
        println!("cargo::rerun-if-env-changed={var}");
    }

    if let Ok(port) = std::env::var("MULTITOOL_MQTT_PORT") {
        if port.parse::<u16>().map_or(true, |p| p == 0) {
            println!(
                "cargo::warning=MULTITOOL_MQTT_PORT={port} is not a valid port, using the default"
            );
        }
    }
}

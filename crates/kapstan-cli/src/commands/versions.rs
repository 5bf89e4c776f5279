use super::{json_pretty, spin_fail, spin_ok, spinner, Controller, EXIT_SUCCESS};

pub fn run(controller: &Controller, cached: bool, json: bool) -> Result<u8, String> {
    if !cached {
        let pb = if json {
            None
        } else {
            Some(spinner("refreshing the version catalog..."))
        };
        match controller.refresh_versions() {
            Ok(()) => {
                if let Some(ref pb) = pb {
                    spin_ok(pb, "catalog refreshed");
                }
            }
            Err(e) => {
                if let Some(ref pb) = pb {
                    spin_fail(pb, "refresh failed");
                }
                return Err(e.to_string());
            }
        }
    }

    let versions = controller.available_versions();
    let active = controller.active_version().map(|v| v.to_string());

    if json {
        let payload = serde_json::json!({
            "versions": versions,
            "active": active,
        });
        println!("{}", json_pretty(&payload)?);
    } else if versions.is_empty() {
        println!("no kubernetes versions known; run `kapstan versions` with network access");
    } else {
        // The catalog lists short versions; drop the build tag before matching.
        let active_short = active
            .as_deref()
            .map(|a| a.split_once('+').map_or(a, |(short, _)| short));
        for version in &versions {
            let marker = if active_short == Some(version.as_str()) {
                " (active)"
            } else {
                ""
            };
            println!("{version}{marker}");
        }
    }
    Ok(EXIT_SUCCESS)
}

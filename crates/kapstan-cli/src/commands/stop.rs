use super::{json_pretty, spin_fail, spin_ok, spinner, Controller, EXIT_SUCCESS};

pub fn run(controller: &Controller, json: bool) -> Result<u8, String> {
    let pb = if json {
        None
    } else {
        Some(spinner("stopping kubernetes..."))
    };

    match controller.stop() {
        Ok(()) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "kubernetes stopped");
            }
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "stop failed");
            }
            return Err(e.to_string());
        }
    }

    if json {
        let payload = serde_json::json!({ "status": "stopped" });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

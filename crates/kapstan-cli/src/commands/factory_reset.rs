use super::{json_pretty, spin_fail, spin_ok, spinner, Controller, EXIT_SUCCESS};

pub fn run(controller: &Controller, json: bool) -> Result<u8, String> {
    let pb = if json {
        None
    } else {
        Some(spinner("removing the guest and all local state..."))
    };

    match controller.factory_reset() {
        Ok(()) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "factory reset complete");
            }
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "factory reset failed");
            }
            return Err(e.to_string());
        }
    }

    if json {
        let payload = serde_json::json!({ "status": "factory-reset" });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

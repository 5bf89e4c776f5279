use super::{json_pretty, spin_fail, spin_ok, spinner, Controller, EXIT_SUCCESS};

pub fn run(controller: &Controller, json: bool) -> Result<u8, String> {
    let pb = if json {
        None
    } else {
        Some(spinner("deleting the guest..."))
    };

    match controller.del() {
        Ok(()) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "guest deleted");
            }
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "delete failed");
            }
            return Err(e.to_string());
        }
    }

    if json {
        let payload = serde_json::json!({ "status": "deleted" });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

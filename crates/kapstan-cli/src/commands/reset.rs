use super::{
    desired_config, json_pretty, spin_fail, spin_ok, spinner, Controller, PartialConfig,
    EXIT_SUCCESS,
};

pub fn run(controller: &Controller, partial: &PartialConfig, json: bool) -> Result<u8, String> {
    let config = desired_config(controller, partial)?;
    let pb = if json {
        None
    } else {
        Some(spinner(&format!(
            "resetting to a fresh kubernetes {}...",
            config.kubernetes_version
        )))
    };

    match controller.reset(&config) {
        Ok(()) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "cluster rebuilt");
            }
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "reset failed");
            }
            return Err(e.to_string());
        }
    }

    if json {
        let payload = serde_json::json!({
            "status": "reset",
            "version": controller.active_version().map(|v| v.to_string()),
            "port": controller.current_port(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "kubernetes {} is listening on port {}",
            config.kubernetes_version, config.port
        );
    }
    Ok(EXIT_SUCCESS)
}

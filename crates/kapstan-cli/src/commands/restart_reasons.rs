use super::{desired_config, json_pretty, Controller, PartialConfig, EXIT_SUCCESS};

pub fn run(controller: &Controller, partial: &PartialConfig, json: bool) -> Result<u8, String> {
    let config = desired_config(controller, partial)?;
    let reasons = controller
        .requires_restart_reasons(&config)
        .map_err(|e| e.to_string())?;

    if json {
        let mut payload = serde_json::Map::new();
        if !reasons.cpu.is_empty() {
            payload.insert(
                "cpus".to_owned(),
                serde_json::json!([reasons.cpu.actual, reasons.cpu.desired]),
            );
        }
        if !reasons.memory.is_empty() {
            payload.insert(
                "memoryGiB".to_owned(),
                serde_json::json!([reasons.memory.actual, reasons.memory.desired]),
            );
        }
        if !reasons.port.is_empty() {
            payload.insert(
                "port".to_owned(),
                serde_json::json!([reasons.port.actual, reasons.port.desired]),
            );
        }
        println!("{}", json_pretty(&serde_json::Value::Object(payload))?);
        return Ok(EXIT_SUCCESS);
    }

    if reasons.is_empty() {
        println!("no restart required");
        return Ok(EXIT_SUCCESS);
    }
    for line in render_lines(&reasons) {
        println!("{line}");
    }
    Ok(EXIT_SUCCESS)
}

fn render_lines(reasons: &kapstan_core::RestartReasons) -> Vec<String> {
    let mut lines = Vec::new();
    if let (Some(actual), Some(desired)) = (reasons.cpu.actual, reasons.cpu.desired) {
        lines.push(format!("cpus: {actual} -> {desired}"));
    }
    if let (Some(actual), Some(desired)) = (reasons.memory.actual, reasons.memory.desired) {
        lines.push(format!("memory: {actual} GiB -> {desired} GiB"));
    }
    if let (Some(actual), Some(desired)) = (reasons.port.actual, reasons.port.desired) {
        lines.push(format!("port: {actual} -> {desired}"));
    }
    lines
}

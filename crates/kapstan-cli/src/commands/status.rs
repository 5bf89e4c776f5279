use super::{colorize_state, json_pretty, state_name, Controller, EXIT_SUCCESS, GIB};

pub fn run(controller: &Controller, json: bool) -> Result<u8, String> {
    let state = controller.state();
    let version = controller.active_version().map(|v| v.to_string());
    let port = controller.current_port();
    let cpus = controller.cpus().map_err(|e| e.to_string())?;
    let memory_gib = controller
        .memory()
        .map_err(|e| e.to_string())?
        .map(|bytes| bytes as f64 / GIB);

    if json {
        let payload = serde_json::json!({
            "state": state_name(state),
            "version": version,
            "port": port,
            "cpus": cpus,
            "memoryGiB": memory_gib,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("state:   {}", colorize_state(state));
    println!("version: {}", version.as_deref().unwrap_or("-"));
    match port {
        Some(port) => println!("port:    {port}"),
        None => println!("port:    -"),
    }
    match cpus {
        Some(cpus) => println!("cpus:    {cpus}"),
        None => println!("cpus:    -"),
    }
    match memory_gib {
        Some(gib) => println!("memory:  {gib} GiB"),
        None => println!("memory:  -"),
    }
    Ok(EXIT_SUCCESS)
}

use spirt_gpuav::config::{DeviceFeatures, Options, CONFIG_ENV_VAR};
use std::io;

fn invalid_data(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// `argv[0]`, which may be missing.
fn program_name(args: &[String]) -> &str {
    args.first().map_or("gpuav-instrument", String::as_str)
}

fn main() -> io::Result<()> {
    let args = std::env::args().collect::<Vec<_>>();
    let (in_file, out_file, unique_shader_id) = match &args[..] {
        [_, in_file, out_file] => (in_file, out_file, 1),
        [_, in_file, out_file, id] => {
            (in_file, out_file, id.parse().map_err(invalid_data)?)
        }
        args => {
            eprintln!("Usage: {} IN OUT [SHADER_ID]", program_name(args));
            eprintln!("(passes are configured through `{CONFIG_ENV_VAR}`)");
            std::process::exit(1);
        }
    };

    let options = Options::from_env().map_err(invalid_data)?;
    let features = DeviceFeatures { buffer_device_address: true, ray_query: true };

    let module =
        spirt_gpuav::Module::parse_spv_bytes(&std::fs::read(in_file)?).map_err(invalid_data)?;
    let shader = spirt_gpuav::instrument::instrument_module(
        &module,
        &options,
        features,
        unique_shader_id,
    )
    .map_err(invalid_data)?;

    std::fs::write(out_file, bytemuck::cast_slice::<u32, u8>(&shader.words))?;

    let summary = serde_json::json!({
        "unique_shader_id": unique_shader_id,
        "records": shader.records,
        "skipped": shader.skipped,
        "linked": shader.linked,
    });
    println!("{}", serde_json::to_string_pretty(&summary).map_err(invalid_data)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_works_without_argv() {
        assert_eq!(program_name(&[]), "gpuav-instrument");
        assert_eq!(program_name(&["gpuav".to_string()]), "gpuav");
    }
}

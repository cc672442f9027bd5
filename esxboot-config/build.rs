use std::collections::HashMap;
use std::env;
use std::fs::{read_to_string, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use phf_codegen;
use toml;

struct EsxbootConfig {
    max_processors: usize,
    log_levels: HashMap<String, &'static str>,
    rts_policy_preference: Vec<&'static str>,
    virtual_window_sizes: HashMap<String, u64>,
}

impl EsxbootConfig {
    fn new(raw: toml::Value) -> EsxbootConfig {
        let mut log_levels = HashMap::new();
        if let Some(raw_log_levels) = raw.get("log_levels") {
            let levels = raw_log_levels.as_table().expect("log_levels must be a table");
            for (key, value) in levels.into_iter() {
                log_levels.insert(key.clone(), to_level_string(value));
            }
        }

        let max_processors = raw
            .get("max_processors")
            .map(|r| r.as_integer().expect("max_processors must be an integer"))
            .unwrap_or(1);

        let rts_policy_preference = raw
            .get("rts_policy_preference")
            .map(|r| {
                r.as_array()
                    .expect("rts_policy_preference must be an array")
                    .iter()
                    .map(|v| to_policy_variant(v))
                    .collect()
            })
            .unwrap_or_else(|| {
                vec!["Contig", "Compact", "Sparse", "SimpleGq", "Simple"]
            });

        let mut virtual_window_sizes = HashMap::new();
        if let Some(raw_windows) = raw.get("virtual_window_size") {
            let windows = raw_windows.as_table().expect("virtual_window_size must be a table");
            for (arch, value) in windows.into_iter() {
                let size = match value {
                    toml::Value::Integer(i) => *i as u64,
                    toml::Value::String(s) => {
                        parse_hex_or_decimal(s).expect("virtual_window_size entries must be integers or hex strings")
                    }
                    _ => panic!("virtual_window_size entries must be integers or hex strings"),
                };
                virtual_window_sizes.insert(arch.clone(), size);
            }
        }

        EsxbootConfig {
            log_levels,
            max_processors: max_processors as usize,
            rts_policy_preference,
            virtual_window_sizes,
        }
    }
}

fn parse_hex_or_decimal(s: &str) -> Option<u64> {
    if let Some(stripped) = s.strip_prefix("0x") {
        u64::from_str_radix(stripped, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn to_level_string(value: &toml::Value) -> &'static str {
    let value = value.as_str().expect("Log levels must be strings");
    match value.to_uppercase().as_str() {
        "OFF" => "LevelFilter::Off",
        "ERROR" => "LevelFilter::Error",
        "WARN" => "LevelFilter::Warn",
        "INFO" => "LevelFilter::Info",
        "DEBUG" => "LevelFilter::Debug",
        "TRACE" => "LevelFilter::Trace",
        _ => panic!("Unknown log level: {}", value),
    }
}

fn to_policy_variant(value: &toml::Value) -> &'static str {
    let value = value.as_str().expect("rts_policy_preference entries must be strings");
    match value.to_lowercase().as_str() {
        "contig" => "Contig",
        "compact" => "Compact",
        "sparse" => "Sparse",
        "simple_gq" | "simplegq" => "SimpleGq",
        "simple" => "Simple",
        _ => panic!("Unknown RTS policy: {}", value),
    }
}

fn main() {
    let config_file = env::current_dir()
        .unwrap()
        .parent()
        .unwrap()
        .join("esxboot.toml");

    println!("cargo:rerun-if-changed={}", config_file.display());

    let contents = read_to_string(&config_file)
        .unwrap_or_else(|e| panic!("could not read {}: {}", config_file.display(), e));
    let config = EsxbootConfig::new(contents.parse::<toml::Value>().expect("Invalid TOML"));

    let output = Path::new(&env::var("OUT_DIR").unwrap()).join("config.rs");
    let mut file = BufWriter::new(File::create(output).unwrap());

    writeln!(&mut file, "use log::LevelFilter;").unwrap();
    writeln!(&mut file, "use esxboot_core::policy::Policy;").unwrap();
    writeln!(&mut file, "use phf;").unwrap();

    write!(&mut file, "pub static MAX_LOG_LEVELS: phf::Map<&'static str, LevelFilter> = ").unwrap();
    let mut log_builder = phf_codegen::Map::new();
    for (target, max_level) in config.log_levels.iter() {
        log_builder.entry(target.as_str(), max_level);
    }
    log_builder.build(&mut file).unwrap();
    writeln!(&mut file, ";").unwrap();

    writeln!(&mut file, "pub const MAX_PROCESSORS: usize = {};", config.max_processors).unwrap();

    writeln!(&mut file, "pub static RTS_POLICY_PREFERENCE: &[Policy] = &[").unwrap();
    for variant in &config.rts_policy_preference {
        writeln!(&mut file, "    Policy::{},", variant).unwrap();
    }
    writeln!(&mut file, "];").unwrap();

    write!(&mut file, "pub static VIRTUAL_WINDOW_SIZES: phf::Map<&'static str, u64> = ").unwrap();
    let mut window_builder = phf_codegen::Map::new();
    for (arch, size) in config.virtual_window_sizes.iter() {
        window_builder.entry(arch.as_str(), &format!("{}u64", size));
    }
    window_builder.build(&mut file).unwrap();
    writeln!(&mut file, ";").unwrap();
}

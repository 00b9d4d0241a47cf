use clap::{App, Arg, ArgMatches};
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

use mandelbrot::{Backend, DeviceInfo, DeviceOptions, RenderConfig};

fn parse_pair<T>(s: &str, separator: char) -> Option<(T, T)>
where
    T: FromStr,
{
    match s.find(separator) {
        None => None,
        Some(index) => match (T::from_str(&s[..index]), T::from_str(&s[index + 1..])) {
            (Ok(l), Ok(r)) => Some((l, r)),
            _ => None,
        },
    }
}

fn validate_pair<T: FromStr>(s: &str, separator: char, err: &str) -> Result<(), String> {
    match parse_pair::<T>(s, separator) {
        Some(_) => Ok(()),
        None => Err(err.to_string()),
    }
}

fn validate_range<T: FromStr + PartialOrd>(
    s: &str,
    low: T,
    high: T,
    isnotanumber_err: &str,
    isnotinrange_err: &str,
) -> Result<(), String> {
    match T::from_str(s) {
        Ok(i) => {
            if i >= low && i <= high {
                Ok(())
            } else {
                Err(isnotinrange_err.to_string())
            }
        }
        Err(_) => Err(isnotanumber_err.to_string()),
    }
}

const OUTPUT: &str = "output";
const PALETTE: &str = "palette";
const SIZE: &str = "size";
const WORKGROUP: &str = "workgroup";
const DEPTH: &str = "depth";
const SCALE: &str = "scale";
const REAL: &str = "real";
const BACKEND: &str = "backend";
const THREADS: &str = "threads";
const DEVICE: &str = "device";
const INFO: &str = "info";

fn args<'a>() -> ArgMatches<'a> {
    let max_threads = num_cpus::get();

    App::new("mandel")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Elf M. Sternberg <elf.sternberg@gmail.com>")
        .about("Mandelbrot renderer")
        .arg(
            Arg::with_name(OUTPUT)
                .long(OUTPUT)
                .short("o")
                .takes_value(true)
                .default_value("mandelbrot.png")
                .help("Output file"),
        )
        .arg(
            Arg::with_name(PALETTE)
                .long(PALETTE)
                .short("p")
                .takes_value(true)
                .default_value("palette.png")
                .help("Image whose pixels, in order, are the color palette"),
        )
        .arg(
            Arg::with_name(SIZE)
                .long(SIZE)
                .short("s")
                .takes_value(true)
                .default_value("1024x1024")
                .validator(|s| validate_pair::<u32>(&s, 'x', "Could not parse output image size"))
                .help("Size of output image"),
        )
        .arg(
            Arg::with_name(WORKGROUP)
                .long(WORKGROUP)
                .short("g")
                .takes_value(true)
                .default_value("32")
                .validator(|s| {
                    validate_range(
                        &s,
                        1u32,
                        1024,
                        "Could not parse work-group size",
                        "Work-group size must be between 1 and 1024",
                    )
                })
                .help("Edge length of a work group; must divide width and height"),
        )
        .arg(
            Arg::with_name(DEPTH)
                .long(DEPTH)
                .short("d")
                .takes_value(true)
                .default_value("1024")
                .validator(|s| {
                    validate_range(
                        &s,
                        1u32,
                        1_000_000,
                        "Could not parse maximum depth",
                        "Maximum depth must be between 1 and 1000000",
                    )
                })
                .help("Iterations before a point counts as inside the set"),
        )
        .arg(
            Arg::with_name(SCALE)
                .long(SCALE)
                .short("f")
                .takes_value(true)
                .default_value("20")
                .validator(|s| {
                    validate_range(
                        &s,
                        std::f32::MIN_POSITIVE,
                        std::f32::MAX,
                        "Could not parse scale force",
                        "Scale force must be greater than zero",
                    )
                })
                .help("Steepness of the palette curve"),
        )
        .arg(
            Arg::with_name(REAL)
                .long(REAL)
                .short("r")
                .takes_value(true)
                .allow_hyphen_values(true)
                .default_value("-2,1")
                .validator(|s| validate_pair::<f32>(&s, ',', "Could not parse real range"))
                .help("Left and right edges of the complex plane"),
        )
        .arg(
            Arg::with_name(BACKEND)
                .long(BACKEND)
                .short("b")
                .takes_value(true)
                .default_value("host")
                .validator(|s| Backend::from_str(&s).map(|_| ()))
                .help("Compute back end: host, shader, opencl or cuda"),
        )
        .arg(
            Arg::with_name(THREADS)
                .long(THREADS)
                .short("t")
                .takes_value(true)
                .validator(move |s| {
                    validate_range(
                        &s,
                        1,
                        max_threads,
                        "Could not parse thread count",
                        &format!("Thread count must be between 1 and {}", max_threads),
                    )
                })
                .help("Number of threads for the host back end [default: all cores]"),
        )
        .arg(
            Arg::with_name(DEVICE)
                .long(DEVICE)
                .takes_value(true)
                .default_value("0")
                .validator(|s| {
                    usize::from_str(&s)
                        .map(|_| ())
                        .map_err(|_| "Could not parse device index".to_string())
                })
                .help("Which of the back end's devices to use"),
        )
        .arg(
            Arg::with_name(INFO)
                .long(INFO)
                .short("i")
                .help("Print a description of the device"),
        )
        .get_matches()
}

fn config(matches: &ArgMatches) -> Option<RenderConfig> {
    let (width, height) = parse_pair(matches.value_of(SIZE)?, 'x')?;
    let (real_min, real_max) = parse_pair(matches.value_of(REAL)?, ',')?;
    Some(RenderConfig {
        width,
        height,
        work_group_size: matches.value_of(WORKGROUP)?.parse().ok()?,
        max_depth: matches.value_of(DEPTH)?.parse().ok()?,
        scale_force: matches.value_of(SCALE)?.parse().ok()?,
        real_min,
        real_max,
        backend: matches.value_of(BACKEND)?.parse().ok()?,
        device: DeviceOptions {
            device_index: matches.value_of(DEVICE)?.parse().ok()?,
            threads: match matches.value_of(THREADS) {
                Some(threads) => threads.parse().ok()?,
                None => num_cpus::get(),
            },
        },
        palette: PathBuf::from(matches.value_of(PALETTE)?),
        output: PathBuf::from(matches.value_of(OUTPUT)?),
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = args();
    let config = match config(&matches) {
        Some(config) => config,
        None => {
            eprintln!("Error parsing arguments");
            std::process::exit(1);
        }
    };

    let show_info = matches.is_present(INFO);
    let report = |device: &DeviceInfo| {
        if show_info {
            println!("{}", device);
            println!();
        }
    };

    match mandelbrot::run_reporting(&config, report) {
        Err(e) => {
            eprintln!("Render failure: {}", e);
            std::process::exit(1);
        }
        Ok(rendered) => println!("Time = {} seconds", rendered.elapsed.as_secs_f32()),
    }
}

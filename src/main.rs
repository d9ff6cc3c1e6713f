//! Tessera CLI - Deferred Tiled Imaging
//!
//! A small demonstration of the Tessera library: lists the built-in
//! operations and runs an image through a lazily evaluated pipeline.

use std::error::Error;
use std::path::PathBuf;
use tessera::prelude::*;

fn main() {
    env_logger::init();
    println!("Tessera - Deferred Tiled Imaging v{}", tessera::VERSION);
    println!();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("tessera");

    if args.len() < 2 {
        print_usage(program);
        return;
    }

    match args[1].as_str() {
        "list" => list_operations(),
        "info" => {
            if args.len() < 3 {
                eprintln!("Error: Please specify an operation name");
                return;
            }
            operation_info(&args[2]);
        }
        "process" => {
            if args.len() < 4 {
                eprintln!("Error: Please specify input and output paths");
                eprintln!("Usage: {} process <input> <output> [options]", program);
                return;
            }
            if let Err(e) = process_image(&args[2..]) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        "help" | "--help" | "-h" => print_usage(program),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(program);
        }
    }
}

fn print_usage(program: &str) {
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  list                          List all available operations");
    println!("  info <operation>              Show details about an operation");
    println!("  process <in> <out> [options]  Process a PNG image");
    println!("  help                          Show this help message");
    println!();
    println!("Process options:");
    println!("  --blur <radius>       Box filter with the given radius");
    println!("  --brighten <amount>   Add a constant to every band");
    println!("  --shift <dx>,<dy>     Translate by whole pixels");
    println!("  --tile <size>         Tile size (default: 256)");
    println!("  --config <file>       Load runtime settings from TOML or JSON");
}

fn list_operations() {
    let registry = OperationRegistry::with_builtins();
    println!("Available operations ({} total):", registry.len());
    println!();

    for category in [
        Category::Generator,
        Category::Arithmetic,
        Category::Geometric,
        Category::Filter,
        Category::Utility,
    ] {
        let names = registry.operations_by_category(category);
        if names.is_empty() {
            continue;
        }
        println!("  {}", category);
        for name in names {
            if let Some(metadata) = registry.get_metadata(name) {
                println!("      {} - {}", metadata.name, metadata.description);
            }
        }
        println!();
    }
}

fn operation_info(name: &str) {
    let registry = OperationRegistry::with_builtins();
    match registry.get_metadata(name) {
        Some(metadata) => {
            println!("Operation: {}", metadata.display_name);
            println!("Name: {}", metadata.name);
            println!("Category: {}", metadata.category);
            println!("Sources: {}", metadata.num_sources);
            println!();
            println!("Description:");
            println!("  {}", metadata.description);
            println!();

            if !metadata.parameters.is_empty() {
                println!("Parameters:");
                for (index, param) in metadata.parameters.iter().enumerate() {
                    println!("  {}. {} = {}", index, param.name, param.default);
                    if !param.description.is_empty() {
                        println!("     {}", param.description);
                    }
                }
            }
        }
        None => {
            eprintln!("Operation not found: {}", name);
            eprintln!("Use 'list' to see available operations.");
        }
    }
}

struct ProcessOptions {
    blur: Option<i64>,
    brighten: Option<f64>,
    shift: Option<(i64, i64)>,
    tile_size: i32,
    config: Option<PathBuf>,
}

fn parse_options(args: &[String]) -> ProcessOptions {
    let mut options = ProcessOptions {
        blur: None,
        brighten: None,
        shift: None,
        tile_size: 256,
        config: None,
    };

    let mut i = 0;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--blur", Some(v)) => options.blur = v.parse().ok(),
            ("--brighten", Some(v)) => options.brighten = v.parse().ok(),
            ("--shift", Some(v)) => options.shift = parse_pair(v),
            ("--tile", Some(v)) => options.tile_size = v.parse().unwrap_or(options.tile_size),
            ("--config", Some(v)) => options.config = Some(PathBuf::from(v)),
            (other, _) => {
                eprintln!("Unknown option: {}", other);
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    options
}

fn parse_pair(text: &str) -> Option<(i64, i64)> {
    let (a, b) = text.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn process_image(args: &[String]) -> Result<(), Box<dyn Error>> {
    let input_path = &args[0];
    let output_path = &args[1];
    let options = parse_options(&args[2..]);

    let config = match &options.config {
        Some(path) => TesseraConfig::load(path)?,
        None => TesseraConfig::default(),
    };
    let session = Session::new(&config)?;

    println!("Loading {}...", input_path);
    let decoded = image::open(input_path)?;
    let input = BufferedImage::from_dynamic_image(&decoded, options.tile_size, options.tile_size)?;
    let mut current = NodeSource::image(input);

    if let Some(radius) = options.blur {
        let block = ParameterBlock::new().with_source(current).with_parameter(radius);
        current = session.create("box_filter", block, RenderingHints::new())?.into();
    }
    if let Some(amount) = options.brighten {
        let block = ParameterBlock::new()
            .with_source(current)
            .with_parameter(vec![amount, amount, amount, 0.0]);
        current = session.create("add_const", block, RenderingHints::new())?.into();
    }
    if let Some((dx, dy)) = options.shift {
        let block = ParameterBlock::new()
            .with_source(current)
            .with_parameter(dx)
            .with_parameter(dy);
        current = session.create("translate", block, RenderingHints::new())?.into();
    }

    let rendering = current.render()?;
    println!(
        "Rendering {} ({} x {} tiles)...",
        rendering.bounds(),
        rendering.num_x_tiles(),
        rendering.num_y_tiles()
    );
    let pixels = rendering.get_data(None)?;
    pixels.to_rgba8().save(output_path)?;

    if let Some(cache) = session.tile_cache() {
        let stats = cache.stats();
        println!(
            "Tile cache: {} tiles, {} hits, {} misses",
            cache.len(),
            stats.hits,
            stats.misses
        );
    }
    println!("Saved {}", output_path);
    Ok(())
}

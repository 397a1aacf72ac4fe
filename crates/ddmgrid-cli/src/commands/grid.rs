//! `ddmgrid grid`: list a grid in dispatch order.

use super::{GridArgs, load_grid};

pub fn run(args: &GridArgs<'_>, json: bool) {
    let specs = load_grid(args);

    if json {
        let summaries: Vec<_> = specs.iter().map(|s| s.summary()).collect();
        match serde_json::to_string_pretty(&summaries) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Error encoding grid: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    println!("{} grid: {} models", args.grid, specs.len());
    for (i, spec) in specs.iter().enumerate() {
        println!(
            "{i:>4}  {:<12} {:>6} trials  {}",
            spec.dataset_name,
            spec.dataset.len(),
            spec.name
        );
    }
}

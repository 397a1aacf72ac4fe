//! Grid overview example.
//!
//! Loads the dataset catalog, builds the nodbs grid over every dataset and prints the size of
//! every expanded model.
//!
//! Run: `cargo run --example grid_overview -- path/to/data`

use std::path::PathBuf;

use ddmgrid_core::{CatalogConfig, GridOptions, build_grid, expand, load_catalog};

fn main() {
    let dir = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("data"), PathBuf::from);

    let catalog = match load_catalog(&dir, &CatalogConfig::default()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot load {}: {e}", dir.display());
            std::process::exit(1);
        }
    };
    println!("Datasets: {}", catalog.names().join(", "));

    let specs = build_grid(&catalog.grid_entries(), &GridOptions::default());
    println!("Models: {}\n", specs.len());

    for spec in &specs {
        match expand(spec) {
            Ok(model) => println!(
                "{:>5} nodes  {:>6} trials  {}",
                model.nodes.len(),
                model.trials.len(),
                model.name
            ),
            Err(e) => println!("  invalid  {}: {e}", spec.name),
        }
    }
}

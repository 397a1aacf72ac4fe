pub mod expand;
pub mod grid;
pub mod run;

use std::path::Path;

use ddmgrid_core::{CatalogConfig, GridKind, GridOptions, ModelSpec, load_catalog};

/// Grid selection shared by every subcommand.
pub struct GridArgs<'a> {
    pub data: &'a str,
    pub grid: &'a str,
    pub full: bool,
}

/// Load the dataset catalog and build the selected grid, exiting on error.
pub fn load_grid(args: &GridArgs<'_>) -> Vec<ModelSpec> {
    let kind: GridKind = match args.grid.parse() {
        Ok(k) => k,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let catalog = match load_catalog(Path::new(args.data), &CatalogConfig::default()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading datasets from {}: {e}", args.data);
            std::process::exit(1);
        }
    };
    let options = GridOptions {
        full: args.full,
        ..Default::default()
    };
    match kind.build(&catalog, &options) {
        Ok(specs) => specs,
        Err(e) => {
            eprintln!("Error building {} grid: {e}", args.grid);
            std::process::exit(1);
        }
    }
}

//! `ddmgrid expand`: print the node graph of one model.

use ddmgrid_core::{NodeLevel, expand};

use super::{GridArgs, load_grid};

pub fn run(model: &str, args: &GridArgs<'_>) {
    let specs = load_grid(args);
    let found = match model.parse::<usize>() {
        Ok(i) => specs.get(i),
        Err(_) => specs.iter().find(|s| s.name == model),
    };
    let Some(spec) = found else {
        eprintln!("Error: no model '{model}' in the {} grid", args.grid);
        std::process::exit(1);
    };

    let expanded = match expand(spec) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    println!("{}", expanded.name);
    println!(
        "  {} nodes, {} trials ({} excluded), {} subjects",
        expanded.nodes.len(),
        expanded.trials.len(),
        expanded.excluded_trials,
        expanded.n_subjects
    );
    println!();

    let width = expanded.nodes.iter().map(|n| n.id.len()).max().unwrap_or(4).max(4);
    println!("{:<width$}  {:<8}  {:<9}  {:>7}  parent", "node", "family", "level", "trials");
    for node in &expanded.nodes {
        let level = match node.level {
            NodeLevel::Group => "group".to_string(),
            NodeLevel::Scale => "scale".to_string(),
            NodeLevel::Subject(s) => format!("subj {s}"),
        };
        let parent = node.parent.map_or_else(String::new, |p| {
            format!(
                "{} / {}",
                expanded.nodes[p.mean].id, expanded.nodes[p.scale].id
            )
        });
        let family = format!("{:?}", node.family).to_lowercase();
        let flag = if node.instantaneous { " *" } else { "" };
        println!(
            "{:<width$}  {family:<8}  {level:<9}  {:>7}  {parent}{flag}",
            node.id, node.n_trials
        );
    }
}

//! Reconciliation output: NHX and recPhyloXML serialisations, event count
//! tables, transfer lists and orthogroups.

use crate::model::scenario::{Event, EventKind, Scenario};
use crate::model::RecModel;
use crate::trees::{GeneTree, HalfEdgeId, SpeciesNodeId, SpeciesTree};
use anyhow::Result;
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn node_name(gene: &GeneTree, u: HalfEdgeId) -> String {
    gene.label(u).map(|l| l.to_string()).unwrap_or_else(|| format!("n{}", u))
}

fn write_nhx_rec(
    out: &mut dyn Write,
    gene: &GeneTree,
    species: &SpeciesTree,
    scenario: &Scenario,
    u: HalfEdgeId,
) -> Result<()> {
    if let Some((left, right)) = gene.children(u) {
        write!(out, "(")?;
        write_nhx_rec(out, gene, species, scenario, left)?;
        write!(out, ",")?;
        write_nhx_rec(out, gene, species, scenario, right)?;
        write!(out, ")")?;
    }
    write!(out, "{}:{}", node_name(gene, u), gene.length(u))?;
    if let Some(event) = scenario.events_of(u).last() {
        if event.kind != EventKind::Invalid {
            write!(out, "[&&NHX:S={}", species.label(event.species))?;
            write!(out, ":D={}", if event.kind == EventKind::D { "Y" } else { "N" })?;
            write!(out, ":H={}", if event.is_transfer() { "Y" } else { "N" })?;
            if event.is_transfer() {
                write!(
                    out,
                    "@{}@{}",
                    species.label(event.species),
                    species.label(event.dest_species.expect("transfer carries a recipient"))
                )?;
            }
            write!(out, ":B={}]", gene.length(u))?;
        }
    }
    Ok(())
}

pub fn save_reconciliation_nhx(
    gene: &GeneTree,
    species: &SpeciesTree,
    scenario: &Scenario,
    path: &Path,
) -> Result<()> {
    let mut out = File::create(path)?;
    let root = scenario.gene_root();
    write!(out, "(")?;
    write_nhx_rec(&mut out, gene, species, scenario, root)?;
    write!(out, ",")?;
    write_nhx_rec(&mut out, gene, species, scenario, gene.back(root))?;
    writeln!(out, ");")?;
    Ok(())
}

/// Append one NHX sample to an already-open writer.
pub fn append_reconciliation_nhx(
    out: &mut dyn Write,
    gene: &GeneTree,
    species: &SpeciesTree,
    scenario: &Scenario,
) -> Result<()> {
    let root = scenario.gene_root();
    write!(out, "(")?;
    write_nhx_rec(out, gene, species, scenario, root)?;
    write!(out, ",")?;
    write_nhx_rec(out, gene, species, scenario, gene.back(root))?;
    writeln!(out, ");")?;
    Ok(())
}

fn write_species_xml_rec(
    out: &mut dyn Write,
    species: &SpeciesTree,
    e: SpeciesNodeId,
    indent: &mut String,
) -> Result<()> {
    writeln!(out, "{}<clade>", indent)?;
    indent.push('\t');
    writeln!(out, "{}<name>{}</name>", indent, species.label(e))?;
    if let Some((f, g)) = species.children(e) {
        write_species_xml_rec(out, species, f, indent)?;
        write_species_xml_rec(out, species, g, indent)?;
    }
    indent.pop();
    writeln!(out, "{}</clade>", indent)?;
    Ok(())
}

fn write_event_xml(
    out: &mut dyn Write,
    species: &SpeciesTree,
    gene_id: usize,
    event: &Event,
    previous: Option<&Event>,
    indent: &str,
) -> Result<()> {
    writeln!(out, "{}<eventsRec>", indent)?;
    if let Some(previous) = previous {
        if previous.is_transfer()
            && previous.transferred_gene == Some(gene_id)
            && event.kind != EventKind::L
        {
            writeln!(
                out,
                "{}\t<transferBack destinationSpecies=\"{}\"/>",
                indent,
                species.label(previous.dest_species.expect("transfer carries a recipient"))
            )?;
        }
    }
    let location = species.label(event.species);
    match event.kind {
        EventKind::Leaf => {
            writeln!(out, "{}\t<leaf speciesLocation=\"{}\"/>", indent, location)?;
        }
        EventKind::S | EventKind::Sl => {
            writeln!(out, "{}\t<speciation speciesLocation=\"{}\"/>", indent, location)?;
        }
        EventKind::D => {
            writeln!(out, "{}\t<duplication speciesLocation=\"{}\"/>", indent, location)?;
        }
        EventKind::T | EventKind::Tl => {
            writeln!(out, "{}\t<branchingOut speciesLocation=\"{}\"/>", indent, location)?;
        }
        EventKind::L => {
            writeln!(out, "{}\t<loss speciesLocation=\"{}\"/>", indent, location)?;
        }
        EventKind::Invalid => {}
    }
    writeln!(out, "{}</eventsRec>", indent)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_gene_xml_rec(
    out: &mut dyn Write,
    gene: &GeneTree,
    species: &SpeciesTree,
    scenario: &Scenario,
    u: usize,
    children: Option<(HalfEdgeId, HalfEdgeId)>,
    label: String,
    previous: Option<&Event>,
    indent: &mut String,
) -> Result<()> {
    let events = scenario.events_of(u);
    let mut previous = previous.cloned();
    let mut opened = 0;
    // SL and TL chains materialise one nested clade per intermediate event,
    // each with an explicit loss sibling.
    for event in events.iter().take(events.len().saturating_sub(1)) {
        writeln!(out, "{}<clade>", indent)?;
        indent.push('\t');
        opened += 1;
        writeln!(out, "{}<name>{}</name>", indent, label)?;
        write_event_xml(out, species, u, event, previous.as_ref(), indent)?;
        let loss_species = match event.kind {
            EventKind::Sl => {
                let (f, g) = species.children(event.species).expect("SL on internal species");
                let dest = event.dest_species.expect("SL carries the surviving species");
                Some(if f == dest { g } else { f })
            }
            EventKind::Tl => Some(event.species),
            _ => None,
        };
        if let Some(loss_species) = loss_species {
            let loss = Event {
                kind: EventKind::L,
                gene: u,
                species: loss_species,
                dest_species: None,
                transferred_gene: None,
                cross: false,
            };
            indent.push('\t');
            writeln!(out, "{}<clade>", indent)?;
            writeln!(out, "{}<name>loss</name>", indent)?;
            write_event_xml(out, species, u, &loss, Some(event), indent)?;
            writeln!(out, "{}</clade>", indent)?;
            indent.pop();
        }
        previous = Some(event.clone());
    }

    writeln!(out, "{}<clade>", indent)?;
    indent.push('\t');
    writeln!(out, "{}<name>{}</name>", indent, label)?;
    if let Some(event) = events.last() {
        write_event_xml(out, species, u, event, previous.as_ref(), indent)?;
        if let Some((left, right)) = children {
            for child in [left, right] {
                write_gene_xml_rec(
                    out,
                    gene,
                    species,
                    scenario,
                    child,
                    gene.children(child),
                    node_name(gene, child),
                    Some(event),
                    indent,
                )?;
            }
        }
    }
    indent.pop();
    writeln!(out, "{}</clade>", indent)?;
    for _ in 0..opened {
        indent.pop();
        writeln!(out, "{}</clade>", indent)?;
    }
    Ok(())
}

pub fn save_reconciliation_xml(
    gene: &GeneTree,
    species: &SpeciesTree,
    scenario: &Scenario,
    path: &Path,
) -> Result<()> {
    let mut out = File::create(path)?;
    writeln!(out, "<recPhylo ")?;
    writeln!(out, "\txmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"")?;
    writeln!(out, "\txsi:schemaLocation=\"http://www.recg.org ./recGeneTreeXML.xsd\"")?;
    writeln!(out, "\txmlns=\"http://www.recg.org\">")?;
    writeln!(out, "<spTree>")?;
    writeln!(out, "<phylogeny>")?;
    let mut indent = String::new();
    write_species_xml_rec(&mut out, species, species.root(), &mut indent)?;
    writeln!(out, "</phylogeny>")?;
    writeln!(out, "</spTree>")?;
    writeln!(out, "<recGeneTree>")?;
    writeln!(out, "<phylogeny rooted=\"true\">")?;
    let root = scenario.gene_root();
    write_gene_xml_rec(
        &mut out,
        gene,
        species,
        scenario,
        scenario.virtual_root_index(),
        Some((root, gene.back(root))),
        "NULL".to_string(),
        None,
        &mut indent,
    )?;
    writeln!(out, "</phylogeny>")?;
    writeln!(out, "</recGeneTree>")?;
    write!(out, "</recPhylo>")?;
    Ok(())
}

pub fn save_events_counts(scenario: &Scenario, path: &Path) -> Result<()> {
    let mut out = File::create(path)?;
    for kind in [
        EventKind::S,
        EventKind::Sl,
        EventKind::D,
        EventKind::T,
        EventKind::Tl,
        EventKind::L,
        EventKind::Leaf,
    ] {
        writeln!(out, "{}:{}", kind.name(), scenario.count(kind))?;
    }
    Ok(())
}

pub fn save_per_species_events_counts(
    scenario: &Scenario,
    species: &SpeciesTree,
    model: RecModel,
    path: &Path,
) -> Result<()> {
    let mut out = File::create(path)?;
    let columns = 1 + model.free_parameters().min(4);
    for e in 0..species.node_count() {
        let counts = scenario.per_species_counts(e);
        write!(out, "{}", species.label(e))?;
        for value in counts.iter().take(columns) {
            write!(out, " {}", value)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

pub fn save_transfers(scenario: &Scenario, species: &SpeciesTree, path: &Path) -> Result<()> {
    let mut out = File::create(path)?;
    for (donor, recipient) in scenario.transfers() {
        writeln!(out, "{} {}", species.label(donor), species.label(recipient))?;
    }
    Ok(())
}

/// Maximal sets of gene leaves related exclusively through speciations.
pub fn orthogroups(gene: &GeneTree, scenario: &Scenario) -> Vec<Vec<String>> {
    fn collect(
        gene: &GeneTree,
        scenario: &Scenario,
        u: usize,
        children: Option<(HalfEdgeId, HalfEdgeId)>,
        finished: &mut Vec<Vec<String>>,
    ) -> Vec<String> {
        let Some((left, right)) = children else {
            return gene.label(u).map(|l| vec![l.to_string()]).unwrap_or_default();
        };
        let group_left = collect(gene, scenario, left, gene.children(left), finished);
        let group_right = collect(gene, scenario, right, gene.children(right), finished);
        let speciation = scenario
            .events_of(u)
            .last()
            .map(|e| matches!(e.kind, EventKind::S | EventKind::Sl))
            .unwrap_or(false);
        if speciation {
            let mut merged = group_left;
            merged.extend(group_right);
            merged
        } else {
            if !group_left.is_empty() {
                finished.push(group_left);
            }
            if !group_right.is_empty() {
                finished.push(group_right);
            }
            Vec::new()
        }
    }

    let mut finished = Vec::new();
    let root = scenario.gene_root();
    let open = collect(
        gene,
        scenario,
        scenario.virtual_root_index(),
        Some((root, gene.back(root))),
        &mut finished,
    );
    if !open.is_empty() {
        finished.push(open);
    }
    finished
}

pub fn save_orthogroups(groups: &[Vec<String>], path: &Path, largest_only: bool) -> Result<()> {
    let mut out = File::create(path)?;
    if largest_only {
        if let Some(largest) = groups.iter().max_by_key(|g| g.len()) {
            writeln!(out, "{}", largest.join(" "))?;
        }
    } else {
        for group in groups {
            writeln!(out, "{}", group.join(" "))?;
        }
    }
    Ok(())
}

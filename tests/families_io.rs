use generax::families;
use generax::io::{fasta, newick};
use generax::scheduler::{read_command_file, write_command_file, Job};
use std::fs;
use std::path::{Path, PathBuf};

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("generax_{}_{}", tag, std::process::id()));
    fs::create_dir_all(&dir).expect("temp dir");
    dir
}

fn write(path: &Path, content: &str) {
    fs::write(path, content).expect("fixture file writes");
}

#[test]
fn families_descriptor_roundtrip() {
    let dir = temp_dir("families");
    let descriptor = dir.join("families.txt");
    write(
        &descriptor,
        "[FAMILIES]\n\
         - fam_a\n\
         mapping = a.map\n\
         alignment = a.fasta\n\
         subst_model = GTR+G\n\
         - fam_b\n\
         mapping = b.map\n\
         starting_gene_tree = __random__\n",
    );
    let parsed = families::parse_families_file(&descriptor).expect("descriptor parses");
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].name, "fam_a");
    assert_eq!(parsed[0].subst_model, "GTR+G");
    assert_eq!(parsed[0].alignment.as_deref(), Some(Path::new("a.fasta")));
    assert_eq!(parsed[1].starting_gene_tree.as_deref(), Some("__random__"));
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn families_descriptor_rejects_orphan_properties() {
    let dir = temp_dir("badfamilies");
    let descriptor = dir.join("families.txt");
    write(&descriptor, "[FAMILIES]\nmapping = orphan.map\n");
    assert!(families::parse_families_file(&descriptor).is_err());
    fs::remove_dir_all(&dir).ok();
}

// Families with broken inputs are dropped, not fatal.
#[test]
fn invalid_families_are_filtered_out() {
    let dir = temp_dir("filter");
    write(&dir.join("good.map"), "g_a a\ng_b b\ng_c c\n");
    write(&dir.join("bad.map"), "g_a unknown_species\ng_b b\n");
    let descriptor = dir.join("families.txt");
    write(
        &descriptor,
        &format!(
            "[FAMILIES]\n\
             - good\n\
             mapping = {}\n\
             - bad\n\
             mapping = {}\n",
            dir.join("good.map").display(),
            dir.join("bad.map").display(),
        ),
    );
    let species = newick::species_tree_from_string("((a,b)x,c)r;").expect("species parses");
    let parsed = families::parse_families_file(&descriptor).expect("descriptor parses");
    let kept = families::filter_families(parsed, Some(&species), false, true);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].name, "good");
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn fasta_roundtrip() {
    let dir = temp_dir("fasta");
    let path = dir.join("toy.fasta");
    write(&path, ">g_a extra tokens\nACGT\nACGT\n>g_b\nTTTT----\n");
    let records = fasta::read_fasta(&path).expect("fasta parses");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].label, "g_a");
    assert_eq!(records[0].sequence, "ACGTACGT");
    assert_eq!(records[1].sequence, "TTTT----");

    let out = dir.join("out.fasta");
    fasta::write_fasta(
        &[("s1".to_string(), "AAAA".to_string()), ("s2".to_string(), "CC-C".to_string())],
        &out,
    )
    .expect("fasta writes");
    let back = fasta::read_fasta(&out).expect("written fasta parses");
    assert_eq!(back.len(), 2);
    assert_eq!(back[1].sequence, "CC-C");
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn command_file_roundtrip() {
    let dir = temp_dir("scheduler");
    let path = dir.join("commands.txt");
    let jobs = vec![
        Job { name: "fam_a".into(), cores: 1, cost: 12, args: vec!["x".into(), "y".into()] },
        Job { name: "fam_b".into(), cores: 1, cost: 3, args: vec!["z".into()] },
    ];
    write_command_file(&jobs, &path).expect("command file writes");
    let back = read_command_file(&path).expect("command file parses");
    assert_eq!(back.len(), 2);
    assert_eq!(back[0].name, "fam_a");
    assert_eq!(back[0].cost, 12);
    assert_eq!(back[0].args, vec!["x".to_string(), "y".to_string()]);
    fs::remove_dir_all(&dir).ok();
}

// The unrooted gene tree hash ignores the parsed orientation, and the
// species tree auto-labels its internal nodes in post-order.
#[test]
fn tree_io_invariants() {
    let one = newick::gene_tree_from_string("((a,b),(c,d));").expect("gene parses");
    let two = newick::gene_tree_from_string("(a,(b,(c,d)));").expect("gene parses");
    assert_eq!(one.unrooted_hash(), two.unrooted_hash());

    let species = newick::species_tree_from_string("((a,b),(c,d));").expect("species parses");
    let labelled: Vec<_> = (0..species.node_count())
        .filter(|&e| !species.is_leaf(e))
        .map(|e| species.label(e).to_string())
        .collect();
    assert_eq!(labelled.len(), 3);
    for label in labelled {
        assert!(label.starts_with("species_"), "internal nodes are auto-labelled: {label}");
    }
}

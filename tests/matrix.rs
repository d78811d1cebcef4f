use std::fs;
use std::io::Write;

use approx::assert_abs_diff_eq;
use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;

use kira_coexpression::error::KiraError;
use kira_coexpression::matrix::{MatrixSpec, load_all};

fn spec(group: &str, file: &str) -> MatrixSpec {
    MatrixSpec {
        group: group.parse().unwrap(),
        file: file.to_string(),
        id_column: None,
        annotation_columns: Vec::new(),
    }
}

#[test]
fn loads_plain_and_gzip_matrices_in_order() {
    let temp = tempfile::tempdir().unwrap();
    let plain = temp.path().join("hsc.txt");
    fs::write(&plain, "ID\tGSM1\tGSM2\nPolb\t1.5\tNA\nActa2\t2\t3\n").unwrap();

    let gz = temp.path().join("liver.txt.gz");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(b"ID\tSYMBOL\tGSM3\nENSG1\tPolb\t0.25\n")
        .unwrap();
    fs::write(&gz, encoder.finish().unwrap()).unwrap();

    let mut liver = spec("in-vivo", "liver.txt.gz");
    liver.annotation_columns = vec!["SYMBOL".to_string()];
    let inputs = vec![(plain, spec("in-vitro", "hsc.txt")), (gz, liver)];
    let matrices = load_all(&inputs).unwrap();

    assert_eq!(matrices.len(), 2);
    assert_eq!(matrices[0].group.as_str(), "in-vitro");
    assert_eq!(matrices[0].samples, ["GSM1", "GSM2"]);
    assert!(matrices[0].values[[0, 1]].is_nan());
    assert_abs_diff_eq!(matrices[0].values[[1, 1]], 3.0);

    assert_eq!(matrices[1].samples, ["GSM3"]);
    assert_eq!(matrices[1].features, ["ENSG1"]);
    assert_abs_diff_eq!(matrices[1].values[[0, 0]], 0.25);
}

#[test]
fn one_bad_matrix_fails_the_batch() {
    let temp = tempfile::tempdir().unwrap();
    let good = temp.path().join("good.txt");
    fs::write(&good, "ID\tGSM1\nGeneA\t1\n").unwrap();
    let bad = temp.path().join("bad.txt");
    fs::write(&bad, "ID\tGSM1\nGeneA\tlow\n").unwrap();

    let inputs = vec![(good, spec("a", "good.txt")), (bad, spec("b", "bad.txt"))];
    assert_matches!(
        load_all(&inputs),
        Err(KiraError::MatrixFormat { file, .. }) if file == "bad.txt"
    );
}

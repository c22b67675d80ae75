use tempfile::TempDir;

use super::*;
use crate::ml_export::{DATASET_FILE, LABELS_DIR, MlExportOptions, YoloWriter, export_dataset};

#[test]
fn test_yolo_labels_are_normalized() {
    let dir = TempDir::new().unwrap();
    let db = Database::open_in_memory().unwrap();
    let image = image_with_spore(&db, &write_png(dir.path(), "spores.png"));
    let out = dir.path().join("yolo");

    let stats = export_dataset(&db, &[image], &out, &YoloWriter, &MlExportOptions::default()).unwrap();
    assert_eq!(stats.annotations_exported, 1);

    let labels = std::fs::read_to_string(out.join(LABELS_DIR).join("image_00001.txt")).unwrap();
    assert_eq!(labels, "0 0.375000 0.333333 0.500000 0.466667\n");

    let yaml = std::fs::read_to_string(out.join(DATASET_FILE)).unwrap();
    assert!(yaml.contains("names:\n  0: spore"));
    assert!(yaml.contains("train: images"));
}

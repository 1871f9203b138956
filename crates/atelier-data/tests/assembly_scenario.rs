//! End-to-end assembly of a small upper-body dataset through the loader.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ndarray::Array3;
use serde_json::json;

use atelier_core::{DataConfig, ResizeOrCrop, SampleErrorPolicy};
use atelier_data::image_ops::{save_gray, save_rgb};
use atelier_data::{
    BatchTensorSet, CropPolicy, DataLoader, DatasetIndex, LoaderConfig, SampleAssembler,
};

const IDS: [&str; 4] = ["img_00", "img_01", "img_02", "img_03"];
const N_ATTR: usize = 6;

fn write_dataset(root: &Path) -> DataConfig {
    for dir in ["Label", "Split", "img", "seg", "edge"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }

    let mut samples = serde_json::Map::new();
    let mut labels = serde_json::Map::new();
    let mut landmarks = serde_json::Map::new();
    let mut segs = serde_json::Map::new();
    let mut edges = serde_json::Map::new();

    for (i, id) in IDS.iter().enumerate() {
        let img = Array3::from_shape_fn((32, 32, 3), |(y, x, c)| ((y * 7 + x * 3 + c * 50 + i * 10) % 256) as f32);
        save_rgb(&img, &root.join(format!("img/{id}.png"))).unwrap();
        // garment (label 3) in the middle rows, background elsewhere
        let seg = Array3::from_shape_fn((32, 32, 1), |(y, _, _)| if (8..24).contains(&y) { 3.0 } else { 0.0 });
        save_gray(&seg, &root.join(format!("seg/{id}.png"))).unwrap();
        let edge = Array3::from_shape_fn((32, 32, 1), |(_, x, _)| if x % 8 == 0 { 255.0 } else { 20.0 });
        save_gray(&edge, &root.join(format!("edge/{id}.png"))).unwrap();

        samples.insert(id.to_string(), json!({"img_path": format!("img/{id}.png"), "cloth_type": 1}));
        let label: Vec<u8> = (0..N_ATTR).map(|a| u8::from(a == i)).collect();
        labels.insert(id.to_string(), json!(label));
        let lms: Vec<[f32; 3]> = (0..6)
            .map(|k| [8.0 + 3.0 * k as f32, 12.0 + k as f32, if k == 5 { 2.0 } else { 0.0 }])
            .collect();
        landmarks.insert(id.to_string(), json!(lms));
        segs.insert(id.to_string(), json!(format!("seg/{id}.png")));
        edges.insert(id.to_string(), json!(format!("edge/{id}.png")));
    }
    let entries: Vec<String> = (0..N_ATTR).map(|a| format!("attr_{a}")).collect();

    let write = |rel: &str, value: serde_json::Value| {
        fs::write(root.join(rel), value.to_string()).unwrap();
    };
    write("Label/ca_samples.json", json!(samples));
    write("Label/ca_attr_label.json", json!(labels));
    write("Label/attr_entry.json", json!(entries));
    write("Split/ca_gan_split_trainval.json", json!({"train": IDS, "test": []}));
    write("Label/ca_landmark_label_256.json", json!(landmarks));
    write("Label/ca_seg_paths.json", json!(segs));
    write("Label/ca_edge_paths.json", json!(edges));

    DataConfig {
        data_root: root.to_path_buf(),
        resize_or_crop: ResizeOrCrop::ResizeAndCrop,
        load_size: 32,
        fine_size: 24,
        edge_threshold: 64,
        color_gaussian_ksz: 5,
        color_gaussian_sigma: 2.0,
        n_attr: N_ATTR,
        ..DataConfig::default()
    }
}

fn channel_max(batch: &BatchTensorSet, name: &str, channel: usize) -> f32 {
    batch
        .get(name)
        .unwrap()
        .narrow(1, channel, 1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[tokio::test]
async fn test_four_sample_upper_body_batch() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_dataset(dir.path());

    let index = Arc::new(DatasetIndex::load(&cfg, "train").unwrap());
    let assembler = SampleAssembler::new(&cfg, index, true).with_crop_policy(CropPolicy::Fixed {
        top: 4,
        left: 4,
        flip: false,
    });
    let loader_cfg = LoaderConfig {
        batch_size: 4,
        num_workers: 2,
        prefetch: 1,
        shuffle: false,
        seed: 0,
        policy: SampleErrorPolicy::FailFast,
    };

    let mut loader = DataLoader::spawn(Arc::new(assembler), loader_cfg, 0);
    assert_eq!(loader.num_batches(), 1);
    let batch = loader.next_batch().await.unwrap().unwrap();
    assert!(loader.next_batch().await.is_none());

    assert_eq!(batch.ids(), &IDS);
    assert_eq!(batch.get("img").unwrap().dims(), &[4, 3, 24, 24]);
    assert_eq!(batch.get("lm_map").unwrap().dims(), &[4, 18, 24, 24]);
    assert_eq!(batch.get("edge_map").unwrap().dims(), &[4, 1, 24, 24]);
    assert_eq!(batch.get("color_map").unwrap().dims(), &[4, 3, 24, 24]);
    assert_eq!(batch.get("seg_mask").unwrap().dims(), &[4, 1, 24, 24]);
    assert_eq!(batch.get("attr_label").unwrap().dims(), &[4, N_ATTR]);

    // visible upper-body landmarks populate channels 0-4, the invisible one stays blank
    for c in 0..5 {
        assert!(channel_max(&batch, "lm_map", c) > 0.5, "channel {c} should be populated");
    }
    assert_eq!(channel_max(&batch, "lm_map", 5), 0.0);
    for c in 6..18 {
        assert_eq!(channel_max(&batch, "lm_map", c), 0.0, "channel {c} should be zero");
    }

    // images are standard normalized
    let img = batch.get("img").unwrap().flatten_all().unwrap();
    let lo = img.min(0).unwrap().to_scalar::<f32>().unwrap();
    let hi = img.max(0).unwrap().to_scalar::<f32>().unwrap();
    assert!(lo >= -1.0 && hi <= 1.0);

    // color maps stay in raw [0, 1], darkest corner included
    let color = batch.get("color_map").unwrap().flatten_all().unwrap();
    let lo = color.min(0).unwrap().to_scalar::<f32>().unwrap();
    let hi = color.max(0).unwrap().to_scalar::<f32>().unwrap();
    assert!(lo >= 0.0 && hi <= 1.0, "color map range [{lo}, {hi}]");
    assert!(lo < 0.25);

    // edge pixels below the threshold are zeroed, the rest scaled to [0, 1]
    let edge = batch.get("edge_map").unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(edge.iter().all(|&v| v == 0.0 || (0.25..=1.0).contains(&v)));

    // garment mask covers the cropped label-3 rows (source rows 8..24 -> crop rows 4..20)
    let mask = batch.get("seg_mask").unwrap().get(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(mask[10][10], 1.0);
    assert_eq!(mask[0][10], 0.0);
    assert_eq!(mask[23][10], 0.0);

    let labels = batch.get("attr_label").unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(labels[2][2], 1.0);
    loader.join().await;
}

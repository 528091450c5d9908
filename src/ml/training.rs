//! モデル学習
//!
//! エポックごとに検証精度を測り、改善したときだけモデルファイルを上書きします
//! （最良スナップショットのチェックポイント）。早期終了や学習率スケジュールはありません。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::dataset::{load_splits, Augmenter, DatasetSplits, RiceDataset, Sample};
use crate::ml::{ModelConfig, RiceCnn};
use crate::model::{artifact_path, save_model_with_metadata, AppConfig, DeviceType, ModelMetadata, TrainingSettings};
use crate::preprocess::{normalize_rgb, open_image};

impl Dataset<Sample> for RiceDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        self.samples().get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples().len()
    }
}

/// バッチャー（画像はバッチ作成時に読み込む）
#[derive(Clone)]
pub struct RiceBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augmenter: Option<Augmenter>,
    rng: Arc<Mutex<StdRng>>,
}

impl<B: Backend> RiceBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            augmenter: None,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(0))),
        }
    }

    /// 学習用のランダム拡張を有効にする
    pub fn with_augmentation(mut self, augmenter: Augmenter, seed: u64) -> Self {
        self.augmenter = Some(augmenter);
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    fn load_pixels(&self, sample: &Sample) -> Result<Vec<f32>> {
        let size = self.image_size as u32;
        let mut image = open_image(&sample.path)?;
        if let Some(augmenter) = &self.augmenter {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            image = augmenter.apply(image, &mut *rng);
        }
        let resized = image.resize_exact(size, size, image::imageops::FilterType::Triangle);
        Ok(normalize_rgb(&resized))
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct RiceBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, Sample, RiceBatch<B>> for RiceBatcher<B> {
    fn batch(&self, items: Vec<Sample>, _device: &B::Device) -> RiceBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            match self.load_pixels(&item) {
                Ok(pixels) => all_pixels.extend_from_slice(&pixels),
                Err(e) => {
                    // バッチの形を崩さないようゼロで埋める
                    warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            targets.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        RiceBatch { images, targets }
    }
}

/// 1エポックの結果
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub num_epochs: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// 検証精度が過去最良を更新したか
    pub improved: bool,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub model_path: PathBuf,
    pub class_names: Vec<String>,
    pub best_epoch: usize,
    pub best_val_accuracy: f64,
    pub test_accuracy: Option<f64>,
}

/// 損失と正解率
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predictions = output.argmax(1).flatten::<1>(0, 1);
    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// データローダー全体で損失と正解率を計算（勾配なし）
pub fn evaluate<B: Backend>(
    model: &RiceCnn<B>,
    dataloader: &Arc<dyn DataLoader<B, RiceBatch<B>>>,
) -> Evaluation {
    let mut loss_sum = 0.0;
    let mut correct = 0usize;
    let mut total = 0usize;

    for batch in dataloader.iter() {
        let batch_size = batch.targets.dims()[0];
        let output = model.forward_classification(batch.images, batch.targets);
        loss_sum += output.loss.into_scalar().elem::<f64>() * batch_size as f64;
        correct += count_correct(output.output, output.targets);
        total += batch_size;
    }

    if total == 0 {
        return Evaluation::default();
    }
    Evaluation {
        loss: loss_sum / total as f64,
        accuracy: correct as f64 / total as f64,
    }
}

fn build_loader<B: Backend>(
    batcher: RiceBatcher<B>,
    dataset: RiceDataset,
    batch_size: usize,
    num_workers: usize,
    shuffle_seed: Option<u64>,
) -> Arc<dyn DataLoader<B, RiceBatch<B>>> {
    let builder = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size.max(1))
        .num_workers(num_workers.max(1));
    match shuffle_seed {
        Some(seed) => builder.shuffle(seed).build(dataset),
        None => builder.build(dataset),
    }
}

pub(crate) fn record_bytes<B: Backend>(model: &RiceCnn<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))
}

/// 最良スナップショットのチェックポイント
///
/// 検証精度が過去最良を上回ったエポックだけモデルファイルを上書きします。
pub struct Checkpointer {
    output_path: PathBuf,
    metadata: ModelMetadata,
    saved_path: Option<PathBuf>,
}

impl Checkpointer {
    pub fn new(output_path: &Path, metadata: ModelMetadata) -> Self {
        Self {
            output_path: output_path.to_path_buf(),
            metadata,
            saved_path: None,
        }
    }

    /// 未保存、または検証精度が最良を上回るか
    pub fn is_improvement(&self, val_accuracy: f64) -> bool {
        self.saved_path.is_none() || val_accuracy > self.metadata.best_val_accuracy
    }

    /// 改善していれば重みを書き出し、保存したかを返す
    ///
    /// 重みのシリアライズは保存するときだけ行います。
    pub fn offer<F>(&mut self, epoch: usize, val_accuracy: f64, weights: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        if !self.is_improvement(val_accuracy) {
            return Ok(false);
        }

        let mut metadata = self.metadata.clone();
        metadata.best_epoch = epoch as u32;
        metadata.best_val_accuracy = val_accuracy;
        let path = save_model_with_metadata(&self.output_path, &metadata, &weights()?)
            .context("チェックポイントの保存に失敗しました")?;
        info!("モデルを保存しました: {}", path.display());

        self.metadata = metadata;
        self.saved_path = Some(path);
        Ok(true)
    }

    /// 最良モデルのテスト精度を記録して保存し直す
    pub fn record_test_accuracy(&mut self, test_accuracy: f64, weights: &[u8]) -> Result<()> {
        self.metadata.test_accuracy = Some(test_accuracy);
        let path = save_model_with_metadata(&self.output_path, &self.metadata, weights)?;
        self.saved_path = Some(path);
        Ok(())
    }

    pub fn best_epoch(&self) -> usize {
        self.metadata.best_epoch as usize
    }

    pub fn best_val_accuracy(&self) -> f64 {
        self.metadata.best_val_accuracy
    }

    /// 保存済みのモデルファイル（まだ保存していなければ `None`）
    pub fn saved_path(&self) -> Option<&Path> {
        self.saved_path.as_deref()
    }
}

/// モデル学習を実行
///
/// 検証精度が改善するたびに `output_path` のモデルファイルを上書きします。
/// テスト分割がある場合は最良モデルで評価し、メタデータに記録します。
pub fn train_model<B, F>(
    splits: DatasetSplits,
    settings: &TrainingSettings,
    input_size: u32,
    output_path: &Path,
    device: B::Device,
    mut on_epoch: F,
) -> Result<TrainingSummary>
where
    B: AutodiffBackend,
    F: FnMut(&EpochReport),
{
    let DatasetSplits {
        labels,
        train,
        val,
        test,
    } = splits;

    if train.is_empty() {
        anyhow::bail!("学習データが見つかりません");
    }
    if val.is_empty() {
        anyhow::bail!("検証データが見つかりません");
    }

    let class_names = labels.into_vec();
    let image_size = input_size as usize;
    let model_config = ModelConfig::new(class_names.len()).with_image_size(image_size);
    let mut model = model_config.init::<B>(&device)?;

    info!(
        "学習を開始します: {} クラス, 入力 {}x{}, エポック数 {}, バッチサイズ {}, 学習率 {}",
        class_names.len(),
        image_size,
        image_size,
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate
    );
    info!(
        "学習データ: {} 枚, 検証データ: {} 枚, テストデータ: {} 枚",
        train.len(),
        val.len(),
        test.as_ref().map_or(0, RiceDataset::len)
    );

    let mut train_batcher = RiceBatcher::<B>::new(device.clone(), image_size);
    if settings.augment {
        train_batcher = train_batcher.with_augmentation(Augmenter::default(), settings.seed);
    }
    let loader_train = build_loader(
        train_batcher,
        train,
        settings.batch_size,
        settings.num_workers,
        Some(settings.seed),
    );
    let loader_val = build_loader(
        RiceBatcher::<B::InnerBackend>::new(device.clone(), image_size),
        val,
        settings.batch_size,
        settings.num_workers,
        None,
    );

    let mut optim = AdamConfig::new().init::<B, RiceCnn<B>>();
    let mut best_model: Option<RiceCnn<B::InnerBackend>> = None;
    let mut checkpointer = Checkpointer::new(
        output_path,
        ModelMetadata::new(
            class_names.clone(),
            input_size,
            settings.num_epochs as u32,
            0,
            0.0,
            settings.split.clone(),
        ),
    );

    for epoch in 1..=settings.num_epochs {
        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        let mut total = 0usize;

        for batch in loader_train.iter() {
            let batch_size = batch.targets.dims()[0];
            let output = model.forward_classification(batch.images, batch.targets);

            loss_sum += output.loss.clone().into_scalar().elem::<f64>() * batch_size as f64;
            correct += count_correct(output.output.clone(), output.targets.clone());
            total += batch_size;

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.learning_rate, model, grads);
        }

        let valid_model = model.valid();
        let val_eval = evaluate(&valid_model, &loader_val);
        let improved = checkpointer.offer(epoch, val_eval.accuracy, || record_bytes(&valid_model))?;
        if improved {
            best_model = Some(valid_model);
        }

        let report = EpochReport {
            epoch,
            num_epochs: settings.num_epochs,
            train_loss: loss_sum / total.max(1) as f64,
            train_accuracy: correct as f64 / total.max(1) as f64,
            val_loss: val_eval.loss,
            val_accuracy: val_eval.accuracy,
            improved,
        };
        info!(
            "エポック {}/{}: loss {:.4}, acc {:.4}, val_loss {:.4}, val_acc {:.4}{}",
            epoch,
            settings.num_epochs,
            report.train_loss,
            report.train_accuracy,
            report.val_loss,
            report.val_accuracy,
            if improved { " (更新)" } else { "" }
        );

        on_epoch(&report);
    }

    let Some(best_model) = best_model else {
        anyhow::bail!("エポック数が0のため学習していません");
    };
    let best_epoch = checkpointer.best_epoch();

    let test_accuracy = match test {
        Some(test) => {
            let loader_test = build_loader(
                RiceBatcher::<B::InnerBackend>::new(device.clone(), image_size),
                test,
                settings.batch_size,
                settings.num_workers,
                None,
            );
            let test_eval = evaluate(&best_model, &loader_test);
            info!(
                "テスト評価: loss {:.4}, acc {:.4} (エポック {} のモデル)",
                test_eval.loss, test_eval.accuracy, best_epoch
            );

            checkpointer.record_test_accuracy(test_eval.accuracy, &record_bytes(&best_model)?)?;
            Some(test_eval.accuracy)
        }
        None => None,
    };

    let model_path = checkpointer
        .saved_path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| artifact_path(output_path));

    Ok(TrainingSummary {
        model_path,
        class_names,
        best_epoch,
        best_val_accuracy: checkpointer.best_val_accuracy(),
        test_accuracy,
    })
}

/// 設定ファイルの内容で学習を実行（バックエンドはデバイス設定で選択）
pub fn run_training<F>(config: &AppConfig, output_path: &Path, on_epoch: F) -> Result<TrainingSummary>
where
    F: FnMut(&EpochReport),
{
    let training = &config.training;
    let splits = load_splits(&training.dataset_dir, &training.split).with_context(|| {
        format!(
            "データセットを読み込めません: {}",
            training.dataset_dir.display()
        )
    })?;

    for (name, count) in splits.train.class_counts() {
        info!("  クラス '{}': {} 枚", name, count);
    }

    let input_size = config.model.input_size;
    match config.device_type {
        DeviceType::Wgpu => {
            type B = burn::backend::Autodiff<burn::backend::Wgpu>;
            let device = burn_wgpu::WgpuDevice::default();
            info!("使用デバイス: {:?}", device);
            train_model::<B, F>(splits, training, input_size, output_path, device, on_epoch)
        }
        DeviceType::Cpu => {
            type B = burn::backend::Autodiff<burn::backend::NdArray>;
            let device = burn_ndarray::NdArrayDevice::Cpu;
            info!("使用デバイス: {:?}", device);
            train_model::<B, F>(splits, training, input_size, output_path, device, on_epoch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ClassLabels, SplitMode};
    use crate::model::{load_metadata, load_model_with_metadata};
    use crate::test_support::write_dataset;
    use burn::backend::{Autodiff, NdArray};
    use burn_ndarray::NdArrayDevice;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_settings(dataset_dir: &Path, epochs: usize, split: SplitMode) -> TrainingSettings {
        TrainingSettings {
            dataset_dir: dataset_dir.to_path_buf(),
            num_epochs: epochs,
            batch_size: 4,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 7,
            split,
            augment: true,
        }
    }

    #[test]
    fn test_batcher_shapes() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), &[("A", 2), ("B", 1)]);
        let labels = ClassLabels::discover(dir.path()).unwrap();
        let dataset = RiceDataset::from_directory(dir.path(), &labels).unwrap();

        let device = NdArrayDevice::Cpu;
        let batcher = RiceBatcher::<NdArray<f32>>::new(device, 24);
        let batch = batcher.batch(dataset.samples().to_vec(), &device);
        assert_eq!(batch.images.dims(), [3, 3, 24, 24]);
        assert_eq!(batch.targets.dims(), [3]);
    }

    #[test]
    fn test_batcher_fills_unreadable_with_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.png");
        std::fs::write(&bad, b"broken").unwrap();

        let device = NdArrayDevice::Cpu;
        let batcher = RiceBatcher::<NdArray<f32>>::new(device, 24);
        let batch = batcher.batch(vec![Sample { path: bad, label: 1 }], &device);
        let total: f32 = batch.images.abs().sum().into_scalar().elem();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_count_correct() {
        let device = NdArrayDevice::Cpu;
        let output = Tensor::<NdArray<f32>, 2>::from_floats([[0.9, 0.1], [0.2, 0.8], [0.6, 0.4]], &device);
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([0, 1, 1], &device);
        assert_eq!(count_correct(output, targets), 2);
    }

    fn checkpoint_metadata() -> ModelMetadata {
        ModelMetadata::new(vec!["A".into(), "B".into()], 24, 3, 0, 0.0, SplitMode::None)
    }

    #[test]
    fn test_checkpoint_saves_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("best.tar.gz");
        let mut checkpointer = Checkpointer::new(&output, checkpoint_metadata());

        let mut saved_epochs = Vec::new();
        for (epoch, accuracy) in [(1, 0.5), (2, 0.4), (3, 0.7)] {
            let weights = format!("epoch{}", epoch).into_bytes();
            if checkpointer.offer(epoch, accuracy, || Ok(weights)).unwrap() {
                saved_epochs.push(epoch);
            }

            if epoch == 2 {
                // 悪化したエポックではファイルが変わらない
                let (metadata, binary) = load_model_with_metadata(&output).unwrap();
                assert_eq!(metadata.best_epoch, 1);
                assert_eq!(metadata.best_val_accuracy, 0.5);
                assert_eq!(binary, b"epoch1");
            }
        }

        assert_eq!(saved_epochs, vec![1, 3]);
        assert_eq!(checkpointer.best_epoch(), 3);
        let (metadata, binary) = load_model_with_metadata(&output).unwrap();
        assert_eq!(metadata.best_epoch, 3);
        assert_eq!(metadata.best_val_accuracy, 0.7);
        assert_eq!(binary, b"epoch3");
    }

    #[test]
    fn test_checkpoint_equal_accuracy_is_not_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpointer = Checkpointer::new(&dir.path().join("best"), checkpoint_metadata());
        assert!(checkpointer.saved_path().is_none());

        assert!(checkpointer.offer(1, 0.0, || Ok(b"first".to_vec())).unwrap());
        let mut serialized = false;
        let saved = checkpointer
            .offer(2, 0.0, || {
                serialized = true;
                Ok(b"second".to_vec())
            })
            .unwrap();
        assert!(!saved);
        assert!(!serialized);
        assert_eq!(checkpointer.saved_path(), Some(dir.path().join("best.tar.gz").as_path()));
    }

    #[test]
    fn test_train_writes_best_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("dataset");
        write_dataset(&data, &[("Basmati", 4), ("Jasmine", 4)]);
        let settings = tiny_settings(&data, 2, SplitMode::None);
        let splits = load_splits(&data, &settings.split).unwrap();

        let output = dir.path().join("model");
        let mut reports = Vec::new();
        let summary = train_model::<TestBackend, _>(
            splits,
            &settings,
            24,
            &output,
            Default::default(),
            |report| reports.push(report.clone()),
        )
        .unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports[0].improved);
        assert!(summary.model_path.exists());
        assert_eq!(summary.class_names, vec!["Basmati", "Jasmine"]);

        let metadata = load_metadata(&summary.model_path).unwrap();
        assert_eq!(metadata.class_names, summary.class_names);
        assert_eq!(metadata.model_input_size, 24);
        assert_eq!(metadata.best_epoch as usize, summary.best_epoch);
        assert!(metadata.test_accuracy.is_none());
    }

    #[test]
    fn test_train_records_test_accuracy() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("dataset");
        write_dataset(&data, &[("A", 5), ("B", 5)]);
        let split = SplitMode::Random {
            train_ratio: 0.6,
            val_ratio: 0.2,
            seed: 3,
        };
        let settings = tiny_settings(&data, 1, split);
        let splits = load_splits(&data, &settings.split).unwrap();
        assert!(splits.test.is_some());

        let summary = train_model::<TestBackend, _>(
            splits,
            &settings,
            24,
            &dir.path().join("model.tar.gz"),
            Default::default(),
            |_| {},
        )
        .unwrap();

        let accuracy = summary.test_accuracy.unwrap();
        assert!((0.0..=1.0).contains(&accuracy));
        let metadata = load_metadata(&summary.model_path).unwrap();
        assert_eq!(metadata.test_accuracy, Some(accuracy));
    }

    #[test]
    fn test_train_rejects_zero_epochs() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), &[("A", 2), ("B", 2)]);
        let settings = tiny_settings(dir.path(), 0, SplitMode::None);
        let splits = load_splits(dir.path(), &settings.split).unwrap();
        let result = train_model::<TestBackend, _>(
            splits,
            &settings,
            24,
            &dir.path().join("model"),
            Default::default(),
            |_| {},
        );
        assert!(result.is_err());
    }
}

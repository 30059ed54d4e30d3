//! # imgload — 命令行入口
//!
//! ```text
//! imgload [--progressive] [--config <file.json>] [--out <file>] <locator>...
//! ```
//!
//! 依次加载每个定位符，打印进度与结果；结果按缓存键写入内存缓存，
//! 同一定位符再次出现时会带上缓存条目作为刷新提示。

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use image_loader_core::cache::{CacheKeyDeriver, MemoryImageCache, lookup, store_if_cacheable};
use image_loader_core::context::{ContextValue, LOADER_CACHED_IMAGE};
use image_loader_core::operation::{LoadProgress, ProgressHandler};
use image_loader_core::{
    CachedImage, Image, ImageLoader, LoadCompletion, LoadContext, LoadEnvironment, LoadError, LoadOptions,
    LoaderConfig, LoaderRegistry, Locator,
};
use tokio::sync::oneshot;

const CACHE_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct CliArgs {
    progressive: bool,
    config: Option<PathBuf>,
    out: Option<PathBuf>,
    locators: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--progressive" => parsed.progressive = true,
            "--config" => {
                let path = args.next().ok_or("--config 需要一个文件路径")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--out" => {
                let path = args.next().ok_or("--out 需要一个文件路径")?;
                parsed.out = Some(PathBuf::from(path));
            }
            flag if flag.starts_with("--") => return Err(format!("未知参数：{}", flag)),
            _ => parsed.locators.push(arg),
        }
    }

    if parsed.locators.is_empty() {
        return Err("至少需要一个定位符".to_string());
    }

    Ok(parsed)
}

fn usage() {
    eprintln!("用法：imgload [--progressive] [--config <file.json>] [--out <file>] <locator>...");
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("❌ {}", message);
            usage();
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(failures) if failures == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("❌ [{}] {}", e.code(), e);
            ExitCode::FAILURE
        }
    }
}

/// 返回失败的定位符数量。
async fn run(args: CliArgs) -> Result<usize, LoadError> {
    let config = match &args.config {
        Some(path) => LoaderConfig::from_json_file(path)?,
        None => LoaderConfig::default(),
    };

    let env = LoadEnvironment::current(config)?;
    let registry = LoaderRegistry::with_default_loaders(&env)?;
    let deriver = CacheKeyDeriver::new();
    let cache = MemoryImageCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN));

    let options = if args.progressive {
        LoadOptions::progressive()
    } else {
        LoadOptions::default()
    };

    let mut failures = 0;
    let mut last_image: Option<Image> = None;

    for raw in &args.locators {
        let locator = match Locator::parse(raw) {
            Ok(locator) => locator,
            Err(e) => {
                eprintln!("❌ {}：{}", raw, e);
                failures += 1;
                continue;
            }
        };

        let key = deriver.derive(&locator);
        let mut context = LoadContext::new();
        if let Some(cached) = lookup(&cache, &key) {
            context = context.with(LOADER_CACHED_IMAGE, ContextValue::CachedImage(cached));
        }

        let completion = load_one(&registry, locator.clone(), options.clone(), context).await;

        match completion.error {
            None => {
                let (Some(image), Some(data)) = (completion.image, completion.data) else {
                    failures += 1;
                    continue;
                };
                println!(
                    "✅ {} {}x{} {:?} {} bytes",
                    locator.redacted(),
                    image.width(),
                    image.height(),
                    image.format(),
                    data.len()
                );
                let entry = CachedImage::new(image.clone())
                    .with_data(data)
                    .with_validator(completion.validator.unwrap_or_default());
                store_if_cacheable(&cache, &key, entry);
                last_image = Some(image);
            }
            Some(LoadError::CacheNotModified) => {
                println!("♻️ {} 未变化，沿用缓存", locator.redacted());
                last_image = lookup(&cache, &key).map(|cached| cached.image).or(last_image);
            }
            Some(err) => {
                println!("❌ {} [{}/{}] {}", locator.redacted(), err.stage(), err.code(), err);
                failures += 1;
            }
        }
    }

    if let (Some(out), Some(image)) = (&args.out, &last_image) {
        image
            .pixels()
            .save(out)
            .map_err(|e| LoadError::DecodeFailed(format!("无法保存图片到 {}：{}", out.display(), e)))?;
        println!("💾 已保存到 {}", out.display());
    }

    println!("📦 缓存条目：{}", cache.len());
    Ok(failures)
}

async fn load_one(
    registry: &LoaderRegistry,
    locator: Locator,
    options: LoadOptions,
    context: LoadContext,
) -> LoadCompletion {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);

    let progress: ProgressHandler = Arc::new(|event: &LoadProgress| match event.expected {
        Some(total) => println!("  ⏬ {}/{} bytes", event.received, total),
        None => println!("  ⏬ {} bytes", event.received),
    });

    registry.load(
        locator,
        options,
        context,
        Some(progress),
        Box::new(move |completion: LoadCompletion| {
            if !completion.is_final {
                if let Some(image) = &completion.image {
                    println!("  🖼️ 中间帧 {}x{}", image.width(), image.height());
                }
                return;
            }
            if let Some(tx) = tx.take() {
                let _ = tx.send(completion);
            }
        }),
    );

    rx.await.unwrap_or_else(|_| {
        LoadCompletion::failure(LoadError::TransferFailed("加载任务未返回结果".to_string()), None)
    })
}

//! 渐进解码、取消抑制、加载器分派的端到端行为。

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::DynamicImage;
use image_loader_core::decode::{ImageCodec, PartialImage};
use image_loader_core::operation::{
    CompletionHandler, LoadProgress, OperationDriver, OperationState, ProgressHandler, TransferOutcome,
};
use image_loader_core::{
    CacheValidator, Image, ImageLoader, LoadContext, LoadEnvironment, LoadError, LoadOperation, LoadOptions,
    LoaderRegistry, Locator,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use common::{
    assert_no_more_events, completion_channel, jpeg_bytes, next_completion, test_config, until_final,
};

/// 行数 = `R` 的个数；以 `END` 结尾才能完整解码。
struct RowCodec;

impl ImageCodec for RowCodec {
    fn decode(
        &self,
        bytes: &[u8],
        _locator: &Locator,
        _options: &LoadOptions,
        _context: &LoadContext,
    ) -> Result<Image, LoadError> {
        if !bytes.ends_with(b"END") {
            return Err(LoadError::DecodeFailed("truncated".into()));
        }
        let rows = bytes.iter().filter(|b| **b == b'R').count().max(1) as u32;
        Ok(Image::new(DynamicImage::new_rgba8(4, rows), None))
    }

    fn decode_partial(&self, bytes: &[u8]) -> Option<PartialImage> {
        let rows = bytes.iter().filter(|b| **b == b'R').count() as u32;
        (rows > 0).then(|| PartialImage {
            image: Image::new(DynamicImage::new_rgba8(4, rows), None),
            quality: rows as u64,
        })
    }
}

/// 记录部分解码次数的 `RowCodec`。
#[derive(Default)]
struct CountingCodec {
    partial_calls: AtomicUsize,
}

impl ImageCodec for CountingCodec {
    fn decode(
        &self,
        bytes: &[u8],
        locator: &Locator,
        options: &LoadOptions,
        context: &LoadContext,
    ) -> Result<Image, LoadError> {
        RowCodec.decode(bytes, locator, options, context)
    }

    fn decode_partial(&self, bytes: &[u8]) -> Option<PartialImage> {
        self.partial_calls.fetch_add(1, Ordering::SeqCst);
        RowCodec.decode_partial(bytes)
    }
}

/// 由测试通过 channel 逐块喂数据的加载器，处理 `test:` 定位符。
struct ScriptedLoader {
    env: LoadEnvironment,
    script: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
}

impl ScriptedLoader {
    fn new(env: LoadEnvironment) -> (Arc<Self>, UnboundedSender<Vec<u8>>) {
        let (tx, rx) = unbounded_channel();
        let loader = Arc::new(Self {
            env,
            script: Mutex::new(Some(rx)),
        });
        (loader, tx)
    }

    async fn pump(
        driver: &mut OperationDriver,
        script: Option<UnboundedReceiver<Vec<u8>>>,
    ) -> Result<TransferOutcome, LoadError> {
        let mut script = script.ok_or_else(|| LoadError::TransferFailed("script already used".into()))?;
        driver.begin(None)?;
        while let Some(chunk) = script.recv().await {
            driver.receive(&chunk).await?;
        }
        Ok(TransferOutcome::Completed {
            validator: CacheValidator::default(),
        })
    }
}

impl ImageLoader for ScriptedLoader {
    fn can_load(&self, locator: &Locator) -> bool {
        locator.scheme() == "test"
    }

    fn load(
        &self,
        locator: Locator,
        options: LoadOptions,
        context: LoadContext,
        progress: Option<ProgressHandler>,
        completed: CompletionHandler,
    ) -> LoadOperation {
        let script = self.script.lock().expect("script lock").take();
        self.env
            .spawn(locator, options, context, progress, completed, move |mut driver| async move {
                let operation = driver.operation().clone();
                let outcome = tokio::select! {
                    outcome = Self::pump(&mut driver, script) => outcome,
                    _ = operation.cancelled() => Err(LoadError::Cancelled),
                };
                driver.finish(outcome).await;
            })
    }
}

fn scripted_env() -> LoadEnvironment {
    LoadEnvironment::current(test_config())
        .expect("environment")
        .with_codec(Arc::new(RowCodec))
}

fn test_locator() -> Locator {
    Locator::parse("test://fixture/progressive").expect("locator")
}

#[tokio::test]
async fn progressive_load_delivers_improving_frames_then_one_final() {
    let (loader, script) = ScriptedLoader::new(scripted_env());
    let (handler, mut events) = completion_channel();

    let operation = loader.load(
        test_locator(),
        LoadOptions::progressive(),
        LoadContext::new(),
        None,
        handler,
    );

    // 第 1 块不可解码：不应有中间帧。
    script.send(b"hdr".to_vec()).expect("send chunk 1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    script.send(b"RR".to_vec()).expect("send chunk 2");
    let after_second = next_completion(&mut events).await;
    assert!(!after_second.is_final);
    assert_eq!(after_second.image.as_ref().map(Image::height), Some(2));
    assert!(after_second.image.as_ref().is_some_and(Image::is_partial));
    assert!(after_second.error.is_none());

    script.send(b"RRRREND".to_vec()).expect("send chunk 3");
    let after_third = next_completion(&mut events).await;
    assert!(!after_third.is_final);
    assert_eq!(after_third.image.as_ref().map(Image::height), Some(6));

    drop(script);
    let (partials, last) = until_final(&mut events).await;
    assert!(partials.is_empty());
    assert!(last.error.is_none());
    assert_eq!(last.image.as_ref().map(Image::height), Some(6));
    assert!(last.image.as_ref().is_some_and(|image| !image.is_partial()));
    assert_eq!(last.data.as_deref(), Some(&b"hdrRRRRRREND"[..]));

    assert_no_more_events(&mut events).await;
    assert_eq!(operation.state(), OperationState::Completed);
}

#[tokio::test]
async fn growing_jpeg_prefixes_deliver_several_partial_frames() {
    let jpeg = jpeg_bytes(64, 256);
    let env = LoadEnvironment::current(test_config()).expect("environment");
    let (loader, script) = ScriptedLoader::new(env);
    let (handler, mut events) = completion_channel();

    loader.load(test_locator(), LoadOptions::progressive(), LoadContext::new(), None, handler);

    let mut sent = 0;
    for percent in [50, 75, 95, 100] {
        let end = jpeg.len() * percent / 100;
        script.send(jpeg[sent..end].to_vec()).expect("send chunk");
        sent = end;
    }
    drop(script);

    let (partials, last) = until_final(&mut events).await;
    assert!(partials.len() >= 2, "expected several partial frames, got {}", partials.len());
    assert!(partials.iter().all(|frame| frame.image.as_ref().is_some_and(Image::is_partial)));
    assert!(partials.iter().all(|frame| frame.image.as_ref().map(Image::height) == Some(256)));
    assert!(last.error.is_none(), "{:?}", last.error);
    assert!(last.image.as_ref().is_some_and(|image| !image.is_partial()));
    assert_no_more_events(&mut events).await;
}

#[tokio::test]
async fn progressive_attempts_are_gated_for_many_small_chunks() {
    let codec = Arc::new(CountingCodec::default());
    let env = LoadEnvironment::current(test_config())
        .expect("environment")
        .with_codec(Arc::clone(&codec) as Arc<dyn ImageCodec>);
    let (loader, script) = ScriptedLoader::new(env);
    let (handler, mut events) = completion_channel();

    loader.load(test_locator(), LoadOptions::progressive(), LoadContext::new(), None, handler);

    for _ in 0..400 {
        script.send(b"R".to_vec()).expect("send");
    }
    script.send(b"END".to_vec()).expect("send");
    drop(script);

    let (partials, last) = until_final(&mut events).await;
    assert!(last.error.is_none(), "{:?}", last.error);
    assert_eq!(last.image.as_ref().map(Image::height), Some(400));
    assert!(!partials.is_empty());

    let calls = codec.partial_calls.load(Ordering::SeqCst);
    assert!(calls < 60, "partial decode ran {calls} times for 401 chunks");
}

#[tokio::test]
async fn non_improving_chunk_produces_no_extra_frame() {
    let (loader, script) = ScriptedLoader::new(scripted_env());
    let (handler, mut events) = completion_channel();

    loader.load(test_locator(), LoadOptions::progressive(), LoadContext::new(), None, handler);

    script.send(b"RRR".to_vec()).expect("send");
    let first = next_completion(&mut events).await;
    assert_eq!(first.image.as_ref().map(Image::height), Some(3));

    script.send(b"xx".to_vec()).expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    script.send(b"END".to_vec()).expect("send");
    drop(script);
    let (partials, last) = until_final(&mut events).await;
    assert!(partials.is_empty());
    assert!(last.image.is_some());
}

#[tokio::test]
async fn truncated_stream_fails_once_with_decode_error() {
    let (loader, script) = ScriptedLoader::new(scripted_env());
    let (handler, mut events) = completion_channel();

    loader.load(test_locator(), LoadOptions::default(), LoadContext::new(), None, handler);

    script.send(b"RRRR".to_vec()).expect("send");
    drop(script);

    let (partials, last) = until_final(&mut events).await;
    assert!(partials.is_empty(), "non-progressive loads never deliver partial frames");
    assert!(matches!(last.error, Some(LoadError::DecodeFailed(_))));
    assert!(last.image.is_none());
    assert_no_more_events(&mut events).await;
}

#[tokio::test]
async fn progress_is_strictly_increasing_and_reaches_total() {
    let (loader, script) = ScriptedLoader::new(scripted_env());
    let (handler, mut events) = completion_channel();
    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress: ProgressHandler = Arc::new(move |event: &LoadProgress| {
        sink.lock().expect("progress lock").push(event.received);
    });

    loader.load(
        test_locator(),
        LoadOptions::default(),
        LoadContext::new(),
        Some(progress),
        handler,
    );

    for chunk in [&b"RR"[..], b"", b"R", b"END"] {
        script.send(chunk.to_vec()).expect("send");
    }
    drop(script);
    let (_, last) = until_final(&mut events).await;
    assert!(last.error.is_none());

    let seen = seen.lock().expect("progress lock").clone();
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&6));
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "progress went backwards: {seen:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_suppresses_every_later_event() {
    let (loader, script) = ScriptedLoader::new(scripted_env());
    let cancel_returned = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(Mutex::new(Vec::new()));
    let (first_tx, mut first_rx) = unbounded_channel();

    let progress: ProgressHandler = {
        let cancel_returned = Arc::clone(&cancel_returned);
        let violations = Arc::clone(&violations);
        Arc::new(move |event: &LoadProgress| {
            if cancel_returned.load(Ordering::SeqCst) {
                violations.lock().expect("violations lock").push(format!("progress {}", event.received));
            }
        })
    };
    let completed: CompletionHandler = {
        let cancel_returned = Arc::clone(&cancel_returned);
        let violations = Arc::clone(&violations);
        Box::new(move |completion| {
            if cancel_returned.load(Ordering::SeqCst) {
                violations
                    .lock()
                    .expect("violations lock")
                    .push(format!("completion final={}", completion.is_final));
            }
            let _ = first_tx.send(());
        })
    };

    let operation = loader.load(
        test_locator(),
        LoadOptions::progressive(),
        LoadContext::new(),
        Some(progress),
        completed,
    );

    script.send(b"RR".to_vec()).expect("send");
    tokio::time::timeout(Duration::from_secs(10), first_rx.recv())
        .await
        .expect("first partial frame");

    operation.cancel();
    cancel_returned.store(true, Ordering::SeqCst);

    // 取消后继续喂数据并结束流，回调都不应再执行。
    let _ = script.send(b"RRRREND".to_vec());
    drop(script);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(violations.lock().expect("violations lock").is_empty());
    assert_eq!(operation.state(), OperationState::Cancelled);
    assert!(operation.is_cancelled());

    operation.cancel();
    assert_eq!(operation.state(), OperationState::Cancelled);
}

#[tokio::test]
async fn cancel_from_inside_callback_does_not_deadlock() {
    let (loader, script) = ScriptedLoader::new(scripted_env());
    let (done_tx, mut done_rx) = unbounded_channel();
    let slot: Arc<Mutex<Option<LoadOperation>>> = Arc::new(Mutex::new(None));
    let slot_in_callback = Arc::clone(&slot);

    let operation = loader.load(
        test_locator(),
        LoadOptions::progressive(),
        LoadContext::new(),
        None,
        Box::new(move |completion| {
            if let Some(operation) = slot_in_callback.lock().expect("slot lock").as_ref() {
                operation.cancel();
            }
            let _ = done_tx.send(completion.is_final);
        }),
    );
    *slot.lock().expect("slot lock") = Some(operation.clone());

    script.send(b"RR".to_vec()).expect("send");
    let first_is_final = tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
        .await
        .expect("first event")
        .expect("channel open");
    assert!(!first_is_final);

    let _ = script.send(b"END".to_vec());
    drop(script);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(done_rx.try_recv().is_err());
    assert_eq!(operation.state(), OperationState::Cancelled);
}

#[tokio::test]
async fn registry_routes_to_priority_loader_and_reports_unsupported() {
    let env = scripted_env();
    let registry = LoaderRegistry::with_default_loaders(&env).expect("registry");
    let (loader, script) = ScriptedLoader::new(env);
    registry.register_with_priority(loader);

    let (handler, mut events) = completion_channel();
    registry.load(test_locator(), LoadOptions::default(), LoadContext::new(), None, handler);
    script.send(b"RREND".to_vec()).expect("send");
    drop(script);
    let (_, last) = until_final(&mut events).await;
    assert!(last.error.is_none());
    assert_eq!(last.image.as_ref().map(Image::height), Some(2));

    let unsupported = Locator::parse("gopher://example.com/a.png").expect("locator");
    assert!(!registry.can_load(&unsupported));

    let (handler, mut events) = completion_channel();
    let operation = registry.load(unsupported, LoadOptions::default(), LoadContext::new(), None, handler);
    let only = next_completion(&mut events).await;
    assert!(only.is_final);
    assert!(matches!(only.error, Some(LoadError::NoCapableLoader(_))));
    assert!(only.image.is_none());
    assert!(only.data.is_none());
    assert!(operation.is_finished());
    assert_no_more_events(&mut events).await;
}

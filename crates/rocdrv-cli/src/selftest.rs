use serde::Serialize;

use rocdrv_driver::{
    Context, ContextFlags, DevicePtr, Dim3, Driver, EventFlags, KernelArg, LaunchParams, StatusOr, Stream,
};

/// Code object for the launch step. The simulated backend runs its built-in
/// `identity` kernel for it; a real runtime rejects text and the step is skipped.
const SELFTEST_KERNELS: &str = r#"
.version 7.0
.target gfx90a

.visible .entry identity(
    .param .u64 input,
    .param .u64 output,
    .param .u32 n
)
{
    ret;
}
"#;

const WORDS: usize = 4096;

// ── Check result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    status: CheckStatus,
    message: String,
}

impl CheckResult {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            message: message.into(),
        }
    }

    fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            message: message.into(),
        }
    }

    fn skip(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Skip,
            message: message.into(),
        }
    }

    fn from_outcome(name: &'static str, outcome: StatusOr<String>) -> Self {
        match outcome {
            Ok(message) => Self::pass(name, message),
            Err(e) => Self::fail(name, e.to_string()),
        }
    }
}

// ── Main entry point ────────────────────────────────────────────────────────

pub fn run_selftest(driver: &Driver, ordinal: i32, json: bool) -> anyhow::Result<()> {
    let device = driver.get_device(ordinal)?;
    let mut ctx = driver.create_context(device, ContextFlags::SCHEDULE_AUTO)?;
    let mut stream = driver.create_stream(&ctx)?;
    let bytes = WORDS * std::mem::size_of::<u32>();
    let mut src = driver.device_allocate(&ctx, bytes)?;
    let mut dst = driver.device_allocate(&ctx, bytes)?;

    let mut results = vec![
        CheckResult::from_outcome("memset", check_memset(driver, &ctx, &stream, src, bytes)),
        CheckResult::from_outcome("memcpy", check_memcpy(driver, &ctx, src, dst, bytes)),
        check_launch(driver, &ctx, &stream, src, dst),
        CheckResult::from_outcome("events", check_events(driver, &ctx, &stream, src, bytes)),
    ];

    let teardown = driver
        .device_deallocate(&ctx, &mut src)
        .and_then(|()| driver.device_deallocate(&ctx, &mut dst))
        .and_then(|()| driver.destroy_stream(&ctx, &mut stream))
        .and_then(|()| driver.destroy_context(&mut ctx));
    results.push(CheckResult::from_outcome(
        "teardown",
        teardown.map(|()| "context destroyed".to_string()),
    ));

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results_pretty(driver, ordinal, &results);
    }

    if results.iter().any(|r| matches!(r.status, CheckStatus::Fail)) {
        std::process::exit(1);
    }
    Ok(())
}

// ── Checks ──────────────────────────────────────────────────────────────────

fn check_memset(driver: &Driver, ctx: &Context, stream: &Stream, ptr: DevicePtr, bytes: usize) -> StatusOr<String> {
    driver.memset_u8_async(ctx, ptr, 0xFF, bytes, stream)?;
    driver.synchronize_stream(ctx, stream)?;
    let mut out = vec![0u8; bytes];
    driver.memcpy_d2h(ctx, &mut out, ptr)?;
    match out.iter().position(|&b| b != 0xFF) {
        None => Ok(format!("{} bytes set to 0xff", bytes)),
        Some(i) => Err(mismatch(format!("byte {} is 0x{:02x}", i, out[i]))),
    }
}

fn check_memcpy(driver: &Driver, ctx: &Context, src: DevicePtr, dst: DevicePtr, bytes: usize) -> StatusOr<String> {
    let pattern: Vec<u32> = (0..WORDS as u32).map(|i| i.wrapping_mul(0x9E37_79B9)).collect();
    driver.memcpy_h2d(ctx, src, &pattern)?;
    driver.memcpy_d2d(ctx, dst, src, bytes)?;
    let mut out = vec![0u32; WORDS];
    driver.memcpy_d2h(ctx, &mut out, dst)?;
    if out != pattern {
        return Err(mismatch("device-to-device copy differs from the source".into()));
    }
    Ok(format!("{} bytes host -> device -> device -> host", bytes))
}

fn check_launch(driver: &Driver, ctx: &Context, stream: &Stream, src: DevicePtr, dst: DevicePtr) -> CheckResult {
    let mut module = match driver.load_ptx(ctx, SELFTEST_KERNELS) {
        Ok(module) => module,
        Err(e) => return CheckResult::skip("launch", format!("selftest kernels not loadable: {}", e)),
    };
    let outcome = (|| -> StatusOr<String> {
        let identity = driver.get_module_function(ctx, &module, "identity")?;
        driver.memset_u8(ctx, dst, 0, WORDS * 4)?;
        let n = WORDS as u32;
        let args = [KernelArg::new(&src), KernelArg::new(&dst), KernelArg::new(&n)];
        // SAFETY: identity takes (u64, u64, u32) and both buffers hold WORDS words.
        unsafe {
            driver.launch_kernel(
                ctx,
                &identity,
                Dim3::new(n.div_ceil(256), 1, 1),
                Dim3::new(256, 1, 1),
                0,
                stream,
                LaunchParams::Args(&args),
            )?;
        }
        driver.synchronize_stream(ctx, stream)?;

        let mut input = vec![0u32; WORDS];
        let mut output = vec![0u32; WORDS];
        driver.memcpy_d2h(ctx, &mut input, src)?;
        driver.memcpy_d2h(ctx, &mut output, dst)?;
        if input != output {
            return Err(mismatch("identity kernel output differs from its input".into()));
        }
        let blocks = driver.get_max_occupied_blocks_per_core(ctx, &identity, 256, 0)?;
        Ok(format!("identity over {} words, {} block(s) per multiprocessor", WORDS, blocks))
    })();
    let unloaded = driver.unload_module(ctx, &mut module);
    CheckResult::from_outcome("launch", outcome.and_then(|m| unloaded.map(|()| m)))
}

fn check_events(driver: &Driver, ctx: &Context, stream: &Stream, ptr: DevicePtr, bytes: usize) -> StatusOr<String> {
    let mut start = driver.create_event(ctx, EventFlags::Default)?;
    let mut stop = driver.create_event(ctx, EventFlags::Default)?;
    driver.record_event(ctx, &start, stream)?;
    driver.memset_u32_async(ctx, ptr, 0, bytes / 4, stream)?;
    driver.record_event(ctx, &stop, stream)?;
    let elapsed = driver.get_event_elapsed_time(ctx, &start, &stop);
    driver.destroy_event(ctx, &mut start)?;
    driver.destroy_event(ctx, &mut stop)?;
    Ok(format!("memset of {} bytes took {:.3} ms", bytes, elapsed?))
}

fn mismatch(message: String) -> rocdrv_driver::DriverError {
    rocdrv_driver::DriverError::InvalidArgument(format!("verification failed: {}", message))
}

// ── Output formatters ───────────────────────────────────────────────────────

fn print_results_pretty(driver: &Driver, ordinal: i32, results: &[CheckResult]) {
    println!();
    println!("rocdrv selftest: device {} ({} backend)", ordinal, driver.backend_name());
    println!("==================================");
    println!();

    let mut pass_count = 0u32;
    let mut fail_count = 0u32;
    for result in results {
        let (icon, color_start, color_end) = match result.status {
            CheckStatus::Pass => {
                pass_count += 1;
                ("[PASS]", "\x1b[32m", "\x1b[0m")
            }
            CheckStatus::Fail => {
                fail_count += 1;
                ("[FAIL]", "\x1b[31m", "\x1b[0m")
            }
            CheckStatus::Skip => ("[SKIP]", "\x1b[90m", "\x1b[0m"),
        };
        println!("  {}{}{} {} - {}", color_start, icon, color_end, result.name, result.message);
    }

    println!();
    println!("  {} passed, {} failed", pass_count, fail_count);
    println!();
}

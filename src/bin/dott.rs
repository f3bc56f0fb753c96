//! DOTT 업로더 CLI
//!
//! 원형 디스플레이 장치로 GIF/펌웨어 업로드
//!
//! 사용법:
//!   cargo run --release --features ble --bin dott -- [OPTIONS] <COMMAND>
//!
//! 예시:
//!   # 업로드 전 검증만 (BLE 불필요)
//!   cargo run --release --bin dott -- validate cat.gif
//!
//!   # 이미지 업로드
//!   cargo run --release --features ble --bin dott -- upload cat.gif
//!
//!   # 펌웨어 업로드 (SMP)
//!   cargo run --release --features ble --bin dott -- -a AA:BB:CC:DD:EE:FF upload app.bin --firmware

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dott::{Config, Payload, PayloadKind};

/// 서브커맨드
#[derive(Debug)]
enum Command {
    Scan,
    Info,
    Upload {
        path: PathBuf,
        firmware: bool,
        force: bool,
    },
    Validate {
        path: PathBuf,
    },
    Reset,
    Confirm,
}

/// CLI 설정
struct CliConfig {
    command: Command,
    address: Option<String>,
    verbose: bool,
    profile: String,
    scan_secs: u64,
}

const USAGE: &str = r#"DOTT - BLE 디스플레이 업로더

사용법:
  dott [OPTIONS] <COMMAND>

명령:
  scan                   주변 DOTT 장치 검색
  info                   펌웨어 이미지 슬롯 조회 (SMP)
  upload <FILE>          GIF (또는 --firmware 시 펌웨어) 업로드
  validate <FILE>        GIF 검증만 수행 (BLE 불필요)
  reset                  장치 리셋 (SMP)
  confirm                현재 실행 중인 이미지를 영구 확정 (SMP)

옵션:
  -a, --address <ADDR>   연결할 장치 주소 (기본: 신호가 가장 센 장치)
  --firmware             펌웨어 이미지로 업로드 (SMP)
  --force                검증 실패해도 업로드
  --profile <NAME>       트리거 프로파일: default | captured | single
  --scan <SECS>          스캔 시간 (기본: 5)
  -v, --verbose          디버그 로그
  -h, --help             이 도움말 출력

종료 코드:
  0  완료 (또는 결과 불확실 - 디스플레이를 직접 확인)
  1  실패 또는 잘못된 입력
"#;

fn parse_args() -> Result<CliConfig, String> {
    let args: Vec<String> = std::env::args().collect();

    let mut command: Option<&str> = None;
    let mut path: Option<PathBuf> = None;
    let mut address = None;
    let mut verbose = false;
    let mut firmware = false;
    let mut force = false;
    let mut profile = "default".to_string();
    let mut scan_secs = 5;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--address" | "-a" => {
                i += 1;
                address = Some(args.get(i).ok_or("--address 값 필요")?.clone());
            }
            "--profile" => {
                i += 1;
                profile = args.get(i).ok_or("--profile 값 필요")?.clone();
            }
            "--scan" => {
                i += 1;
                scan_secs = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .ok_or("--scan 에는 초 단위 숫자 필요")?;
            }
            "--firmware" => firmware = true,
            "--force" => force = true,
            "--verbose" | "-v" => verbose = true,
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            arg if arg.starts_with('-') => return Err(format!("알 수 없는 옵션: {}", arg)),
            arg if command.is_none() => command = Some(arg),
            _ if path.is_none() => path = Some(PathBuf::from(&args[i])),
            arg => return Err(format!("불필요한 인자: {}", arg)),
        }
        i += 1;
    }

    let needs_path = |path: Option<PathBuf>, name: &str| {
        path.ok_or_else(|| format!("{} 명령에는 파일 경로가 필요", name))
    };
    let command = match command {
        Some("scan") => Command::Scan,
        Some("info") => Command::Info,
        Some("reset") => Command::Reset,
        Some("confirm") => Command::Confirm,
        Some("upload") => Command::Upload {
            path: needs_path(path, "upload")?,
            firmware,
            force,
        },
        Some("validate") => Command::Validate {
            path: needs_path(path, "validate")?,
        },
        Some(other) => return Err(format!("알 수 없는 명령: {}", other)),
        None => return Err("명령이 필요 (--help 참고)".into()),
    };

    Ok(CliConfig {
        command,
        address,
        verbose,
        profile,
        scan_secs,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("{}\n\n{}", msg, USAGE);
            return ExitCode::FAILURE;
        }
    };

    // 로깅 설정
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("로거 설정 실패: {}", e);
    }

    let Some(config) = Config::profile(&cli.profile) else {
        error!("알 수 없는 프로파일: {} (default | captured | single)", cli.profile);
        return ExitCode::FAILURE;
    };

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: CliConfig, config: Config) -> dott::Result<ExitCode> {
    match cli.command {
        Command::Validate { path } => validate(&path, &config).await,
        command => device::run(command, cli.address.as_deref(), cli.scan_secs, config).await,
    }
}

async fn validate(path: &Path, config: &Config) -> dott::Result<ExitCode> {
    let payload = Payload::load(path, PayloadKind::Image).await?;
    let report = payload.validate(&config.gif_limits());

    info!("파일: {} ({} bytes)", path.display(), payload.len());
    info!("  크기: {}x{}", report.width, report.height);
    info!("  프레임: {}", report.frames);
    info!("  SHA-256: {}", payload.digest_hex());

    if report.is_valid() {
        info!("검증 통과");
        Ok(ExitCode::SUCCESS)
    } else {
        for violation in &report.violations {
            warn!("  - {}", violation);
        }
        error!("검증 실패: {}개 문제", report.violations.len());
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(feature = "ble")]
mod device {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use dott::ble::{self, BleLink};
    use dott::{
        Config, ImageSlot, Payload, PayloadKind, SmpClient, TransferMode, TransferOutcome,
        TransferSession,
    };
    use tracing::{error, info, warn};

    use super::{Command, ExitCode};

    pub async fn run(
        command: Command,
        address: Option<&str>,
        scan_secs: u64,
        config: Config,
    ) -> dott::Result<ExitCode> {
        let scan_time = Duration::from_secs(scan_secs);
        match command {
            Command::Scan => scan(scan_time).await,
            Command::Info => {
                let link = Arc::new(BleLink::find(address, scan_time, &config).await?);
                let mut smp = SmpClient::connect(link.clone(), &config).await?;
                log_slots(&smp.image_state().await?);
                link.disconnect().await?;
                Ok(ExitCode::SUCCESS)
            }
            Command::Confirm => {
                let link = Arc::new(BleLink::find(address, scan_time, &config).await?);
                let mut smp = SmpClient::connect(link.clone(), &config).await?;
                log_slots(&smp.confirm_image(None).await?);
                link.disconnect().await?;
                Ok(ExitCode::SUCCESS)
            }
            Command::Reset => {
                let link = Arc::new(BleLink::find(address, scan_time, &config).await?);
                let mut smp = SmpClient::connect(link, &config).await?;
                smp.reset().await?;
                Ok(ExitCode::SUCCESS)
            }
            Command::Upload {
                path,
                firmware,
                force,
            } => upload(&path, firmware, force, address, scan_time, config).await,
            Command::Validate { .. } => Ok(ExitCode::SUCCESS),
        }
    }

    fn log_slots(slots: &[ImageSlot]) {
        if slots.is_empty() {
            warn!("이미지 슬롯 정보 없음");
        }
        for slot in slots {
            info!(
                "슬롯 {}: v{} active={} confirmed={} pending={} hash={}",
                slot.slot,
                slot.version,
                slot.active,
                slot.confirmed,
                slot.pending,
                slot.hash.as_deref().map(hex::encode).unwrap_or_default()
            );
        }
    }

    async fn scan(scan_time: Duration) -> dott::Result<ExitCode> {
        let adapter = ble::adapter().await?;
        let devices = ble::scan(&adapter, scan_time).await?;
        if devices.is_empty() {
            warn!("DOTT 장치를 찾지 못함");
            return Ok(ExitCode::FAILURE);
        }
        for device in devices {
            info!("{}  {}  RSSI={:?}", device.address, device.name, device.rssi);
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn upload(
        path: &Path,
        firmware: bool,
        force: bool,
        address: Option<&str>,
        scan_time: Duration,
        config: Config,
    ) -> dott::Result<ExitCode> {
        let (kind, mode) = if firmware {
            (PayloadKind::Firmware, TransferMode::Framed)
        } else {
            (PayloadKind::Image, TransferMode::RawStream)
        };
        let payload = Payload::load(path, kind).await?;

        // 연결 전에 검증해서 잘못된 파일로 장치를 깨우지 않는다
        let validation = payload.validate(&config.gif_limits());
        if !validation.is_valid() && !force {
            for violation in &validation.violations {
                warn!("  - {}", violation);
            }
            error!("검증 실패, --force 로 강제 업로드 가능");
            return Ok(ExitCode::FAILURE);
        }

        let link = Arc::new(BleLink::find(address, scan_time, &config).await?);
        let mut session =
            TransferSession::new(link.clone(), config.clone()).allow_invalid_payload(force);
        let report = session.upload(&payload, mode).await?;

        // 펌웨어는 업로드 후 슬롯 상태로 확인
        if mode == TransferMode::Framed && report.is_completed() {
            match verify_upload(link.clone(), &config).await {
                Ok(true) => info!("새 이미지가 보조 슬롯에 있음. reset 후 부팅, 정상이면 confirm"),
                Ok(false) => warn!("비활성 슬롯이 보이지 않음"),
                Err(e) => warn!("이미지 상태 확인 실패: {}", e),
            }
        }
        if let Err(e) = link.disconnect().await {
            warn!("연결 해제 실패: {}", e);
        }

        info!("{}", report.stats.summary());
        match &report.outcome {
            TransferOutcome::Completed => {
                info!("업로드 완료 ({} bytes)", report.total_len);
                Ok(ExitCode::SUCCESS)
            }
            TransferOutcome::Unknown => {
                warn!(
                    "완료 여부 불확실 ({}/{} bytes 전송). 디스플레이를 직접 확인하세요",
                    report.last_offset, report.total_len
                );
                for evidence in &report.evidence {
                    warn!("  [{}] {}: {:?}", evidence.channel, evidence.classification, evidence.text);
                }
                Ok(ExitCode::SUCCESS)
            }
            TransferOutcome::Failed(e) => {
                error!(
                    "업로드 실패: {} (offset {}/{})",
                    e, report.last_offset, report.total_len
                );
                for evidence in &report.evidence {
                    error!("  [{}] {}: {:?}", evidence.channel, evidence.classification, evidence.text);
                }
                Ok(ExitCode::FAILURE)
            }
        }
    }

    /// 업로드 직후 이미지 상태 조회. 비활성 슬롯이 있으면 true
    async fn verify_upload(link: Arc<BleLink>, config: &Config) -> dott::Result<bool> {
        let mut smp = SmpClient::connect(link, config).await?;
        let slots = smp.image_state().await?;
        log_slots(&slots);
        Ok(slots.iter().any(|slot| !slot.active))
    }
}

#[cfg(not(feature = "ble"))]
mod device {
    use tracing::error;

    use super::{Command, ExitCode};
    use dott::Config;

    pub async fn run(
        command: Command,
        _address: Option<&str>,
        _scan_secs: u64,
        _config: Config,
    ) -> dott::Result<ExitCode> {
        error!("{:?} 명령은 BLE 지원이 필요 (--features ble 로 빌드)", command);
        Ok(ExitCode::FAILURE)
    }
}

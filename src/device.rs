use std::cell::Cell;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cudarc::driver::CudaContext;

const MEMORY_RESERVE_MIB_FLOOR: u64 = 64;
const MEMORY_RESERVE_RATIO_DENOM: u64 = 64;

#[derive(Debug, Clone)]
pub struct CudaDevice {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
    pub memory_free_mib: Option<u64>,
}

pub fn query_devices() -> Result<Vec<CudaDevice>> {
    let output = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .context("failed to execute nvidia-smi; ensure NVIDIA drivers are installed")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            bail!(
                "nvidia-smi returned non-zero exit status ({})",
                output.status
            );
        }
        bail!("nvidia-smi query failed: {stderr}");
    }

    let stdout = String::from_utf8(output.stdout).context("nvidia-smi output was not UTF-8")?;
    let devices = parse_smi_query_output(&stdout)?;
    if devices.is_empty() {
        bail!("nvidia-smi reported no NVIDIA devices");
    }

    Ok(devices)
}

/// Parses `index,name,memory.total[,memory.free]` CSV rows. Device names may
/// themselves contain commas, so the name spans every column between the
/// index and the trailing memory figures. memory.free reads as `[N/A]` on
/// some driver stacks and is treated as absent rather than an error.
fn parse_smi_query_output(raw: &str) -> Result<Vec<CudaDevice>> {
    let mut devices = Vec::new();
    for (line_idx, raw_line) in raw.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let columns = line.split(',').collect::<Vec<_>>();
        if columns.len() < 3 {
            bail!(
                "unexpected nvidia-smi output at line {}: '{line}'",
                line_idx + 1
            );
        }

        let index = columns[0].trim().parse::<u32>().with_context(|| {
            format!(
                "invalid GPU index '{}' at line {}",
                columns[0].trim(),
                line_idx + 1
            )
        })?;
        let (name_columns_end, memory_total_mib, memory_free_mib) = if columns.len() >= 4 {
            let total_idx = columns.len() - 2;
            let free_idx = columns.len() - 1;
            let total = columns[total_idx].trim().parse::<u64>().with_context(|| {
                format!(
                    "invalid GPU memory.total value '{}' at line {}",
                    columns[total_idx].trim(),
                    line_idx + 1
                )
            })?;
            let free = columns[free_idx].trim().parse::<u64>().ok();
            (total_idx, total, free)
        } else {
            let total = columns[columns.len() - 1]
                .trim()
                .parse::<u64>()
                .with_context(|| {
                    format!(
                        "invalid GPU memory.total value '{}' at line {}",
                        columns[columns.len() - 1].trim(),
                        line_idx + 1
                    )
                })?;
            (columns.len() - 1, total, None)
        };
        let name = columns[1..name_columns_end].join(",").trim().to_string();
        if name.is_empty() {
            bail!("missing GPU name at line {}", line_idx + 1);
        }

        devices.push(CudaDevice {
            index,
            name,
            memory_total_mib,
            memory_free_mib,
        });
    }

    Ok(devices)
}

pub fn select_device(devices: &[CudaDevice], requested: Option<u32>) -> Result<&CudaDevice> {
    match requested {
        Some(index) => devices
            .iter()
            .find(|device| device.index == index)
            .ok_or_else(|| {
                anyhow!(
                    "CUDA device {index} not found ({} device(s) reported by nvidia-smi)",
                    devices.len()
                )
            }),
        None => devices
            .first()
            .ok_or_else(|| anyhow!("no CUDA devices available")),
    }
}

/// Usable device memory in MiB after holding back headroom for the driver
/// and display. Falls back to the total when free memory is unknown.
pub fn memory_budget_mib(memory_total_mib: u64, memory_free_mib: Option<u64>) -> u64 {
    let total = memory_total_mib.max(1);
    let reserve = (total / MEMORY_RESERVE_RATIO_DENOM)
        .max(MEMORY_RESERVE_MIB_FLOOR)
        .min(total.saturating_sub(1).max(1));

    let available = memory_free_mib.unwrap_or(total).max(1).min(total);
    available.saturating_sub(reserve).max(1)
}

/// Capability handle for one accelerator: the only path through which a
/// processing unit touches its device.
pub trait DeviceBinding {
    fn index(&self) -> u32;

    /// Makes the device current on the calling thread; a no-op when it
    /// already is.
    fn ensure_bound(&self) -> Result<()>;
}

thread_local! {
    static BOUND_DEVICE: Cell<Option<u32>> = Cell::new(None);
}

/// Owns the CUDA primary context for one device index.
pub struct CudaDeviceBinding {
    index: u32,
    ctx: Arc<CudaContext>,
}

impl CudaDeviceBinding {
    pub fn new(index: u32) -> Result<Self> {
        let ctx = CudaContext::new(index as usize)
            .map_err(|err| anyhow!("failed to open CUDA context on device {index}: {err:?}"))?;
        BOUND_DEVICE.with(|bound| bound.set(Some(index)));
        Ok(Self { index, ctx })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }
}

impl DeviceBinding for CudaDeviceBinding {
    fn index(&self) -> u32 {
        self.index
    }

    fn ensure_bound(&self) -> Result<()> {
        let current = BOUND_DEVICE.with(Cell::get);
        if current == Some(self.index) {
            return Ok(());
        }
        self.ctx.bind_to_thread().map_err(|err| {
            anyhow!(
                "failed to bind CUDA device {} to this thread: {err:?}",
                self.index
            )
        })?;
        BOUND_DEVICE.with(|bound| bound.set(Some(self.index)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_smi_query_output_parses_multiple_rows() {
        let parsed = parse_smi_query_output(
            "0, NVIDIA GeForce RTX 3080, 10240, 9800\n1, NVIDIA RTX A4000, 16384, 16000\n",
        )
        .expect("query output should parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].index, 0);
        assert_eq!(parsed[0].name, "NVIDIA GeForce RTX 3080");
        assert_eq!(parsed[0].memory_total_mib, 10_240);
        assert_eq!(parsed[0].memory_free_mib, Some(9_800));
        assert_eq!(parsed[1].index, 1);
        assert_eq!(parsed[1].name, "NVIDIA RTX A4000");
    }

    #[test]
    fn parse_smi_query_output_joins_comma_names() {
        let parsed = parse_smi_query_output("0, Tesla, K80, 12206, 11000")
            .expect("comma name should parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "Tesla, K80");
        assert_eq!(parsed[0].memory_total_mib, 12_206);
        assert_eq!(parsed[0].memory_free_mib, Some(11_000));
    }

    #[test]
    fn parse_smi_query_output_tolerates_unknown_free_memory() {
        let parsed = parse_smi_query_output("0, NVIDIA GeForce GTX 1660, 6144, [N/A]")
            .expect("unknown free memory should parse");
        assert_eq!(parsed[0].memory_total_mib, 6_144);
        assert_eq!(parsed[0].memory_free_mib, None);
    }

    #[test]
    fn parse_smi_query_output_rejects_invalid_rows() {
        let err =
            parse_smi_query_output("abc, RTX, 8192").expect_err("invalid index should fail");
        assert!(format!("{err:#}").contains("invalid GPU index"));
    }

    #[test]
    fn select_device_prefers_requested_index() {
        let devices = parse_smi_query_output("0, A, 1024, 900\n2, B, 2048, 1800\n")
            .expect("fixture should parse");

        let first = select_device(&devices, None).expect("default selection should succeed");
        assert_eq!(first.index, 0);

        let second = select_device(&devices, Some(2)).expect("index 2 should resolve");
        assert_eq!(second.name, "B");

        let err = select_device(&devices, Some(1)).expect_err("missing index should fail");
        assert!(format!("{err:#}").contains("device 1 not found"));
    }

    #[test]
    fn memory_budget_uses_free_vram_with_headroom() {
        assert_eq!(memory_budget_mib(10_240, Some(9_800)), 9_640);
        assert_eq!(memory_budget_mib(10_240, None), 10_080);
        assert!(memory_budget_mib(64, Some(32)) >= 1);
    }
}

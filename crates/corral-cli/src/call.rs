//! Call command: one request to a pool started with `serve --listen`.

use anyhow::Context;
use corral_core::ListenAddr;
use corral_core::ipc::request;

pub fn execute(addr: &str, payload: &str, max_frame_size: usize) -> anyhow::Result<()> {
    let addr: ListenAddr = addr.parse()?;
    let replies = request(&addr, payload.as_bytes(), max_frame_size)
        .with_context(|| format!("request to {} failed", addr))?;
    for reply in replies {
        println!("{}", String::from_utf8_lossy(&reply));
    }
    Ok(())
}

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;

use rccs::bootstrap::{get_unique_id, BootstrapError, BootstrapState};

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "Bootstrap Demo")]
struct Opts {
    /// Number of in-process ranks to rendezvous.
    #[structopt(long, default_value = "4")]
    num_ranks: usize,
    /// Per-rank contribution size for the all-gather, in bytes.
    #[structopt(short, long, default_value = "16")]
    size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::from_args();
    let num_ranks = opts.num_ranks;
    let slice_size = opts.size;

    let handle = get_unique_id()?;
    log::info!(
        "bootstrap handle: {} (magic {:#x})",
        handle.addr,
        handle.magic
    );

    let mut tasks = Vec::new();
    for rank in 0..num_ranks {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            let abort_flag = Arc::new(AtomicU32::new(0));
            let init = BootstrapState::init(&handle, rank, num_ranks, abort_flag).await?;
            let state = init.state;

            let mut buf = vec![0u8; num_ranks * slice_size];
            for b in &mut buf[rank * slice_size..(rank + 1) * slice_size] {
                *b = rank as u8;
            }
            state.all_gather(&mut buf).await?;
            let stamps: Vec<u8> = (0..num_ranks).map(|r| buf[r * slice_size]).collect();
            println!("Rank {}: gathered slice stamps {:?}", rank, stamps);

            let ranks: Vec<usize> = (0..num_ranks).collect();
            state.barrier(&ranks, 0x11).await?;
            println!("Rank {}: barrier passed", rank);

            // One p2p token pass around the ring.
            let next = (rank + 1) % num_ranks;
            let prev = (rank + num_ranks - 1) % num_ranks;
            state.send(next, 42, &(rank as u32).to_be_bytes()).await?;
            let mut token = [0u8; 4];
            state.recv(prev, 42, &mut token).await?;
            println!(
                "Rank {}: received token {} from rank {}",
                rank,
                u32::from_be_bytes(token),
                prev
            );

            state.close()?;
            Ok::<_, BootstrapError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }
    log::info!("all {} ranks done", num_ranks);
    Ok(())
}

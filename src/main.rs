use log::{debug, info};
use nor_ftl::config::*;
use nor_ftl::{FlashTranslationLayer, FtlConfig, RamFlash};
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

const UNITS: usize = 64;

fn main() -> nor_ftl::Result<()> {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    SimpleLogger::init(LevelFilter::Info, log_cfg).unwrap();

    let op = DEFAULT_OP;
    let mut fw = FlashTranslationLayer::new(RamFlash::with_units(UNITS), FtlConfig::new_with_op(op))?;
    fw.format()?;
    let max_lba = fw.info().block_count - 1;

    let mut block = vec![0u8; BLOCK_SIZE];
    for lba in 0..=max_lba {
        block.fill(lba as u8);
        fw.write(lba, 1, &block)?;
    }
    info!("Drive preconditioned");

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);

    for c in 0..4 {
        for _ in 0..=max_lba {
            let lba = rng.gen_range(0..=max_lba);
            rng.fill(&mut block[..]);
            fw.write(lba, 1, &block)?;
        }
        let stats = fw.stats();
        info!(
            "Capacity {} randomly written: {} reclaims, erase counts {}..={}",
            c, stats.reclaims, stats.min_erase_count, stats.max_erase_count
        );
    }

    let flash = fw.into_flash();
    debug!("flash ops: {:?}", flash.counters());
    let fw = FlashTranslationLayer::open(flash, FtlConfig::new_with_op(op))?;
    info!("Remounted, {} free slots", fw.stats().free_slots);
    Ok(())
}

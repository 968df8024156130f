use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use pmlfs::{Options, PmRegion, Pmlfs};

const BLOCK: usize = 4096;

fn bench_options() -> Options {
    let mut options = Options::default();
    options.set_bulk_from_str("bg_gc=false");
    options
}

/// Copy-on-write block writes, with a periodic checkpoint-and-drop cycle
/// so the log keeps wrapping instead of running out of segments.
fn bench_write_path(c: &mut Criterion) {
    let region = PmRegion::map_anonymous(256 << 20).unwrap();
    let fs = Pmlfs::format(region, bench_options()).unwrap();
    let ino = fs.create_inode().unwrap();
    let payload = [0xabu8; BLOCK];
    let mut index = 0u16;
    let mut writes = 0u64;
    let mut last_cp = 0u32;

    c.bench_function("write_data_block", |b| {
        b.iter(|| {
            fs.write_data_block(ino, index, &payload).unwrap();
            index = (index + 1) % 64;
            writes += 1;
            if writes % 2048 == 0 {
                let v = fs.write_checkpoint(false).unwrap();
                if last_cp != 0 {
                    fs.delete_checkpoint(last_cp).unwrap();
                }
                last_cp = v;
            }
        })
    });
}

fn bench_checkpoint(c: &mut Criterion) {
    let region = PmRegion::map_anonymous(256 << 20).unwrap();
    let fs = Pmlfs::format(region, bench_options()).unwrap();
    let ino = fs.create_inode().unwrap();
    let payload = [0x5au8; BLOCK];
    let mut index = 0u16;
    let mut last_cp = 0u32;

    c.bench_function("write_checkpoint", |b| {
        b.iter(|| {
            fs.write_data_block(ino, index, &payload).unwrap();
            index = (index + 1) % 64;
            let v = fs.write_checkpoint(false).unwrap();
            if last_cp != 0 {
                fs.delete_checkpoint(last_cp).unwrap();
            }
            last_cp = v;
        })
    });
}

criterion_group!(benches, bench_write_path, bench_checkpoint);
criterion_main!(benches);

//! Builds a file system image on the host: format it, then copy the listed
//! files into the root directory through the live engine so the result is
//! exactly what the kernel would have produced.

use std::{env, fs::File, io::Read as _, path::Path, process, sync::Arc};

use oscale_fs::{
    BSIZE, BlockDevice, DeviceNo, FileDevice, FileSystem, InodeType, LockMode,
    mkfs::{self, MkfsOptions},
};

/// Blocks written per transaction when importing file contents; keeps each
/// transaction well under the journal's capacity.
const IMPORT_CHUNK_BLOCKS: usize = 128;

fn main() {
    let args = env::args().collect::<Vec<String>>();
    if args.len() < 2 {
        eprintln!("Usage: {} fs.img [files...]", args[0]);
        process::exit(1);
    }
    let image_file = &args[1];
    let contents = &args[2..];

    if let Err(e) = run(Path::new(image_file), contents) {
        eprintln!("mkfs: {e}");
        process::exit(1);
    }
}

fn run(image: &Path, contents: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let opts = MkfsOptions::default();
    let device = Arc::new(FileDevice::create(image, opts.size)?) as Arc<dyn BlockDevice>;
    let sb = mkfs::format(&device, &opts)?;
    eprintln!(
        "nmeta {} (boot, super, inode blocks {}, bitmap blocks {}, journal {}) data {} total {}",
        sb.data_start(),
        sb.inode_table_blocks(),
        sb.bitmap_blocks(),
        sb.njournal,
        sb.nblocks,
        sb.size
    );

    if contents.is_empty() {
        return Ok(());
    }

    let fs = FileSystem::mount(device)?;
    let root = fs.root();
    for name in contents {
        let short_name = name.rsplit('/').next().unwrap();

        let mut data = Vec::new();
        File::open(name)?.read_to_end(&mut data)?;

        let ip = fs.ialloc(DeviceNo::ROOT, InodeType::File)?;
        {
            let tx = fs.begin_transaction();
            tx.log_new_file(ip.inum());
            fs.iupdate(&ip, Some(&tx))?;
            fs.commit_transaction(tx)?;
            fs.flush_journal()?;
        }

        let mut off = 0;
        while off < data.len() {
            let n = usize::min(IMPORT_CHUNK_BLOCKS * BSIZE, data.len() - off);
            let tx = fs.begin_transaction();
            let written = fs.writei(&ip, &data[off..off + n], off, Some(&tx), false)?;
            assert_eq!(written, n, "short write importing {name}");
            fs.update_size(&ip, (off + n) as u32, &tx)?;
            fs.commit_transaction(tx)?;
            fs.flush_journal()?;
            off += n;
        }
        let tx = fs.begin_transaction();
        root.ilock(LockMode::Write);
        fs.dirlink(&root, short_name.as_bytes(), ip.inum(), false, &tx)?;
        root.iunlock();
        fs.iupdate(&ip, Some(&tx))?;
        ip.iunlock();
        fs.commit_transaction(tx)?;
        fs.flush_journal()?;

        eprintln!("  {short_name}: inum {}, {} bytes", ip.inum(), data.len());
    }
    Ok(())
}

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::process;

use cbm_d64::disk::{DiskError, FileOps, FileType, Location, D64};

// Possible exit codes
static EXIT_FAILURE: i32 = 1;

/// If a dash is specified for a filename, this indicates that the user wants
/// to read from standard input or write to standard output.
static STDINOUT_PSEUDOFILENAME: &str = "-";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // Parse command-line arguments
    let app = App::new("Commodore 1541 Disk Image Utility")
        .version("0.1.0")
        .about("Create, edit, and check D64 disk images.")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("diskimage").required(true))
        .subcommand(
            SubCommand::with_name("bam")
                .about("Block Availability Map (BAM) commands")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("show").about("Show the Block Availability Map (BAM)"),
                )
                .subcommand(
                    SubCommand::with_name("allocate")
                        .about("Mark block(s) as allocated in the BAM.")
                        .arg(
                            Arg::with_name("track")
                                .validator(optional_track_validator)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("sector")
                                .validator(optional_sector_validator)
                                .required(true),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("free")
                        .about("Mark block(s) as free in the BAM.")
                        .arg(
                            Arg::with_name("track")
                                .validator(optional_track_validator)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("sector")
                                .validator(optional_sector_validator)
                                .required(true),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("Read a file from a disk image.")
                .arg(Arg::with_name("source_filename").required(true))
                .arg(Arg::with_name("destination_filename").required(false)),
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Write a file to a disk image.")
                .arg(
                    Arg::with_name("type")
                        .short("t")
                        .long("type")
                        .takes_value(true)
                        .possible_values(&["prg", "seq", "usr", "rel"])
                        .default_value("seq")
                        .help("CBM file type"),
                )
                .arg(
                    Arg::with_name("record_length")
                        .long("record-length")
                        .takes_value(true)
                        .validator(record_length_validator)
                        .required_if("type", "rel")
                        .help("Record length of a relative (REL) file"),
                )
                .arg(Arg::with_name("source_filename").required(true))
                .arg(Arg::with_name("destination_filename").required(false)),
        )
        .subcommand(
            SubCommand::with_name("create")
                .about("Create a blank disk image")
                .arg(
                    Arg::with_name("tracks")
                        .long("tracks")
                        .takes_value(true)
                        .possible_values(&["35", "40"])
                        .default_value("35")
                        .help("Number of tracks"),
                )
                .arg(
                    Arg::with_name("name")
                        .long("name")
                        .takes_value(true)
                        .default_value("NEW DISK")
                        .help("Disk name"),
                ),
        )
        .subcommand(
            SubCommand::with_name("dir")
                .about("Show a directory listing")
                .arg(
                    Arg::with_name("verbose")
                        .short("v")
                        .long("verbose")
                        .multiple(true)
                        .help("Show more detail"),
                ),
        )
        .subcommand(
            SubCommand::with_name("format")
                .about("Format a disk image")
                .arg(Arg::with_name("name").required(true))
                .arg(Arg::with_name("id").required(false)),
        )
        .subcommand(
            SubCommand::with_name("rename")
                .about("Rename a file.")
                .arg(Arg::with_name("original_filename").required(true))
                .arg(Arg::with_name("new_filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("Delete (scratch) a file.")
                .arg(Arg::with_name("filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("lock")
                .about("Lock a file.")
                .arg(Arg::with_name("filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("unlock")
                .about("Unlock a file.")
                .arg(Arg::with_name("filename").required(true)),
        )
        .subcommand(SubCommand::with_name("sort").about("Sort the directory by filename."))
        .subcommand(
            SubCommand::with_name("first")
                .about("Move a file to the head of the directory.")
                .arg(Arg::with_name("filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("compact")
                .about("Pack the directory and free unused directory sectors."),
        )
        .subcommand(
            SubCommand::with_name("dump")
                .about("Provide a hex dump of a disk image or file.")
                .arg(Arg::with_name("filename").required(false)),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Check the BAM against the files on a disk image.")
                .arg(
                    Arg::with_name("fix")
                        .long("fix")
                        .help("Repair the BAM where it disagrees"),
                )
                .arg(
                    Arg::with_name("log")
                        .long("log")
                        .takes_value(true)
                        .help("Write the report to a file"),
                ),
        );

    let mut app_clone = app.clone();
    let matches = app.get_matches();

    let diskimage = matches.value_of("diskimage").unwrap_or_default();
    let result = match matches.subcommand() {
        ("bam", Some(m)) => match m.subcommand() {
            ("show", Some(_)) => cmd_bam_show(diskimage),
            ("allocate", Some(m)) => cmd_bam_edit(diskimage, m, true),
            ("free", Some(m)) => cmd_bam_edit(diskimage, m, false),
            _ => usage(&mut app_clone),
        },
        ("read", Some(m)) => cmd_read(
            diskimage,
            m.value_of("source_filename").unwrap_or_default(),
            m.value_of("destination_filename"),
        ),
        ("write", Some(m)) => cmd_write(
            diskimage,
            m.value_of("source_filename").unwrap_or_default(),
            m.value_of("destination_filename"),
            m.value_of("type")
                .and_then(FileType::from_string)
                .unwrap_or(FileType::SEQ),
            m.value_of("record_length")
                .and_then(|n| n.parse::<usize>().ok()),
        ),
        ("create", Some(m)) => cmd_create(
            diskimage,
            m.value_of("tracks") == Some("40"),
            m.value_of("name").unwrap_or_default(),
        ),
        ("dir", Some(m)) => cmd_dir(diskimage, m.occurrences_of("verbose")),
        ("format", Some(m)) => cmd_format(
            diskimage,
            m.value_of("name").unwrap_or_default(),
            m.value_of("id"),
        ),
        ("rename", Some(m)) => cmd_rename(
            diskimage,
            m.value_of("original_filename").unwrap_or_default(),
            m.value_of("new_filename").unwrap_or_default(),
        ),
        ("delete", Some(m)) => cmd_edit(diskimage, |disk| {
            disk.remove_file(m.value_of("filename").unwrap_or_default())
        }),
        ("lock", Some(m)) => cmd_edit(diskimage, |disk| {
            disk.lock_file(m.value_of("filename").unwrap_or_default())
        }),
        ("unlock", Some(m)) => cmd_edit(diskimage, |disk| {
            disk.unlock_file(m.value_of("filename").unwrap_or_default())
        }),
        ("sort", Some(_)) => cmd_edit(diskimage, |disk| {
            if !disk.sort_directory_by(|a, b| a.name().cmp(&b.name()))? {
                println!("Directory is already sorted.");
            }
            Ok(())
        }),
        ("first", Some(m)) => cmd_edit(diskimage, |disk| {
            disk.move_file_first(m.value_of("filename").unwrap_or_default())
                .map(|_| ())
        }),
        ("compact", Some(_)) => cmd_edit(diskimage, |disk| {
            let freed = disk.compact_directory()?;
            println!("{} directory sectors freed.", freed);
            Ok(())
        }),
        ("dump", Some(m)) => cmd_dump(diskimage, m.value_of("filename")),
        ("verify", Some(m)) => cmd_verify(diskimage, m.is_present("fix"), m.value_of("log")),
        _ => usage(&mut app_clone),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(EXIT_FAILURE);
    }
}

fn usage(app: &mut App) -> io::Result<()> {
    app.print_help().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    println!();
    process::exit(EXIT_FAILURE);
}

fn optional_u8_parser(v: &str, min: u8, max: u8) -> Result<Option<u8>, ()> {
    if v == "all" {
        Ok(None)
    } else {
        match v.parse::<u8>() {
            Ok(n) if n >= min && n <= max => Ok(Some(n)),
            _ => Err(()),
        }
    }
}

fn optional_u8_validator(v: String, min: u8, max: u8) -> Result<(), String> {
    match optional_u8_parser(&v, min, max) {
        Ok(_) => Ok(()),
        Err(_) => Err(format!(
            "Expected a value from {}-{}, or \"all\".",
            min, max
        )),
    }
}

/// Require a track argument to be a number in the range 1-40 or "all".
fn optional_track_validator(v: String) -> Result<(), String> {
    optional_u8_validator(v, 1, 40)
}

/// Require a sector argument to be a number in the range 0-20 or "all".
fn optional_sector_validator(v: String) -> Result<(), String> {
    optional_u8_validator(v, 0, 20)
}

fn record_length_validator(v: String) -> Result<(), String> {
    match v.parse::<usize>() {
        Ok(n) if n >= 1 && n <= 254 => Ok(()),
        _ => Err("Expected a record length from 1-254.".to_string()),
    }
}

/// Open an existing disk image, apply an edit, and flush the result.
fn cmd_edit<F>(diskimage: &str, edit: F) -> io::Result<()>
where
    F: FnOnce(&mut D64) -> io::Result<()>,
{
    let mut disk = D64::open(diskimage, true)?;
    edit(&mut disk)?;
    disk.flush()
}

fn cmd_bam_show(diskimage: &str) -> io::Result<()> {
    let disk = D64::open(diskimage, false)?;
    print!("{:?}", disk.bam()?);
    println!("{} blocks free.", disk.blocks_free()?);
    Ok(())
}

fn cmd_bam_edit(diskimage: &str, m: &ArgMatches, allocate: bool) -> io::Result<()> {
    let track = optional_u8_parser(m.value_of("track").unwrap_or_default(), 1, 40)
        .map_err(|_| DiskError::InvalidLocation.to_io_error())?;
    let sector = optional_u8_parser(m.value_of("sector").unwrap_or_default(), 0, 20)
        .map_err(|_| DiskError::InvalidLocation.to_io_error())?;
    // Ranges may cover sectors that are already in the requested state.
    let ranged = track.is_none() || sector.is_none();

    let mut disk = D64::open(diskimage, true)?;
    let format = disk.disk_format();
    let track_range = match track {
        Some(t) => t..=t,
        None => format.first_track..=format.last_track,
    };
    for track in track_range {
        let sector_range = match sector {
            Some(s) => s..=s,
            None => 0..=(format.sectors_in_track(track).saturating_sub(1)),
        };
        for sector in sector_range {
            let location = Location(track, sector);
            let result = if allocate {
                disk.allocate_sector(location)
            } else {
                disk.free_sector(location)
            };
            match result {
                Err(ref e)
                    if ranged
                        && (*e == DiskError::SectorAlreadyAllocated
                            || *e == DiskError::SectorAlreadyFree
                            || *e == DiskError::ProtectedSector
                            || *e == DiskError::InvalidLocation) => {}
                result => result?,
            }
        }
    }
    disk.flush()
}

/// Open a file for reading
fn open_fs_reader(filename: &str) -> io::Result<Box<dyn Read>> {
    if filename == STDINOUT_PSEUDOFILENAME {
        Ok(Box::new(io::stdin()))
    } else {
        Ok(Box::new(fs::File::open(filename)?))
    }
}

/// Open a file for writing
fn open_fs_writer(filename: &str) -> io::Result<Box<dyn Write>> {
    if filename == STDINOUT_PSEUDOFILENAME {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(fs::File::create(filename)?))
    }
}

fn cmd_read(
    diskimage: &str,
    source_filename: &str,
    destination_filename: Option<&str>,
) -> io::Result<()> {
    let destination_filename = destination_filename.unwrap_or(source_filename);
    let disk = D64::open(diskimage, false)?;
    let mut reader = disk.open_file(source_filename)?.reader()?;
    let mut writer = open_fs_writer(destination_filename)?;
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(())
}

fn cmd_write(
    diskimage: &str,
    source_filename: &str,
    destination_filename: Option<&str>,
    file_type: FileType,
    record_length: Option<usize>,
) -> io::Result<()> {
    let destination_filename = destination_filename.unwrap_or(source_filename);
    let mut data = vec![];
    open_fs_reader(source_filename)?.read_to_end(&mut data)?;

    let mut disk = D64::open(diskimage, true)?;
    let entry = match (file_type, record_length) {
        (FileType::REL, Some(record_length)) => {
            disk.add_relative_file(destination_filename, &data, record_length)?
        }
        (FileType::REL, None) => return Err(DiskError::InvalidRelativeFile.into()),
        (file_type, _) => disk.add_file(destination_filename, file_type, &data)?,
    };
    disk.flush()?;
    println!("{}", entry);
    Ok(())
}

fn cmd_create(diskimage: &str, forty_tracks: bool, name: &str) -> io::Result<()> {
    let geometry = if forty_tracks {
        D64::geometry_40_tracks()
    } else {
        D64::geometry()
    };
    let mut disk = D64::with_geometry(geometry)?;
    disk.format(name)?;

    // Never overwrite an existing image.
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(diskimage)?;
    file.write_all(disk.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn cmd_dir(diskimage: &str, verbosity: u64) -> io::Result<()> {
    let disk = D64::open(diskimage, false)?;
    if verbosity == 0 {
        println!("{}", disk);
        return Ok(());
    }
    println!("{}", disk.header()?);
    for entry in disk.iter() {
        let entry = entry?;
        println!("{:#}", entry);
        if verbosity > 1 {
            let file = disk.open_file_from_entry(&entry)?;
            file.details(&mut io::stdout(), (verbosity as usize) - 2)?;
            println!();
        }
    }
    println!("{} blocks free.", disk.blocks_free()?);
    Ok(())
}

fn cmd_format(diskimage: &str, name: &str, id: Option<&str>) -> io::Result<()> {
    cmd_edit(diskimage, |disk| match id {
        Some(id) => disk.format_with_id(name, &id.into()),
        None => disk.format(name),
    })
}

fn cmd_rename(diskimage: &str, original_filename: &str, new_filename: &str) -> io::Result<()> {
    cmd_edit(diskimage, |disk| {
        disk.rename_file(original_filename, new_filename)
    })
}

fn cmd_dump(diskimage: &str, filename: Option<&str>) -> io::Result<()> {
    let disk = D64::open(diskimage, false)?;
    match filename {
        Some(filename) => {
            let file = disk.open_file(filename)?;
            file.dump(&mut io::stdout())?;
        }
        None => disk.dump(&mut io::stdout())?,
    }
    io::stdout().flush()?;
    Ok(())
}

fn cmd_verify(diskimage: &str, fix: bool, log: Option<&str>) -> io::Result<()> {
    let mut disk = D64::open(diskimage, fix)?;
    let mut log_file = match log {
        Some(path) => Some(fs::File::create(path)?),
        None => None,
    };
    let consistent = disk.verify(
        fix,
        log_file.as_mut().map(|f| f as &mut dyn Write),
    )?;
    if fix {
        disk.flush()?;
    }
    if consistent {
        println!("Disk verifies successfully.");
        Ok(())
    } else if fix {
        println!("Disk was repaired.");
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "disk image is inconsistent (use --fix to repair the BAM)",
        ))
    }
}

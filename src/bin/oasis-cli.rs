use anyhow::Result;
use clap::Parser;
use oasisdb::{CollectionOptions, Database, Document, Options};
use rustyline::DefaultEditor;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "oasis-cli", about = "Interactive OasisDB shell")]
struct Args {
    /// Database directory.
    #[arg(long, default_value = "oasisdb.data")]
    path: PathBuf,
    /// Query-result cache capacity (entries); 0 disables it.
    #[arg(long, default_value_t = 0)]
    cache_size: u64,
    /// Log filter, e.g. `info` or `oasisdb=debug`.
    #[arg(long, default_value = "warn")]
    log: String,
}

#[derive(Debug)]
enum Command {
    Create {
        name: String,
        dimension: usize,
        index_type: Option<String>,
    },
    Drop {
        name: String,
    },
    Collections,
    Put {
        collection: String,
        id: String,
        vector: Vec<f32>,
    },
    Get {
        collection: String,
        id: String,
    },
    Del {
        collection: String,
        id: String,
    },
    Search {
        collection: String,
        k: usize,
        vector: Vec<f32>,
    },
    Params {
        collection: String,
        key: String,
        value: String,
    },
    Stats,
    Help,
    Quit,
}

impl Command {
    /// Parse one REPL line with nom.
    fn parse(input: &str) -> Result<Self> {
        use nom::branch::*;
        use nom::bytes::complete::*;
        use nom::character::complete::*;
        use nom::combinator::*;
        use nom::multi::*;
        use nom::number::complete::float;
        use nom::sequence::*;

        let uint = |i| {
            map_res(digit1::<&str, nom::error::Error<_>>, |s: &str| {
                s.parse::<usize>()
                    .map_err(|_| nom::error::Error::new(s, nom::error::ErrorKind::Digit))
            })(i)
        };

        let word = |i| {
            map(
                take_till1(|c: char| c.is_whitespace() || c == '='),
                |s: &str| s.to_string(),
            )(i)
        };

        let vector = |i| separated_list1(tag(","), float)(i);

        let create = |i| {
            map(
                tuple((
                    tag_no_case("create"),
                    space1,
                    word,
                    space1,
                    uint,
                    opt(preceded(space1, word)),
                )),
                |(_, _, name, _, dimension, index_type)| Command::Create {
                    name,
                    dimension,
                    index_type,
                },
            )(i)
        };
        let drop = |i| {
            map(
                tuple((tag_no_case("drop"), space1, word)),
                |(_, _, name)| Command::Drop { name },
            )(i)
        };
        let collections = |i| map(tag_no_case("collections"), |_| Command::Collections)(i);
        let put = |i| {
            map(
                tuple((tag_no_case("put"), space1, word, space1, word, space1, vector)),
                |(_, _, collection, _, id, _, vector)| Command::Put {
                    collection,
                    id,
                    vector,
                },
            )(i)
        };
        let get = |i| {
            map(
                tuple((tag_no_case("get"), space1, word, space1, word)),
                |(_, _, collection, _, id)| Command::Get { collection, id },
            )(i)
        };
        let del = |i| {
            map(
                tuple((tag_no_case("del"), space1, word, space1, word)),
                |(_, _, collection, _, id)| Command::Del { collection, id },
            )(i)
        };
        let search = |i| {
            map(
                tuple((tag_no_case("search"), space1, word, space1, uint, space1, vector)),
                |(_, _, collection, _, k, _, vector)| Command::Search {
                    collection,
                    k,
                    vector,
                },
            )(i)
        };
        let params = |i| {
            map(
                tuple((
                    tag_no_case("params"),
                    space1,
                    word,
                    space1,
                    word,
                    tag("="),
                    word,
                )),
                |(_, _, collection, _, key, _, value)| Command::Params {
                    collection,
                    key,
                    value,
                },
            )(i)
        };
        let stats = |i| map(tag_no_case("stats"), |_| Command::Stats)(i);
        let help = |i| map(tag_no_case("help"), |_| Command::Help)(i);
        let quit = |i| {
            map(alt((tag_no_case("quit"), tag_no_case("exit"))), |_| {
                Command::Quit
            })(i)
        };

        let (rest, command) = alt((
            create,
            drop,
            collections,
            put,
            get,
            del,
            search,
            params,
            stats,
            help,
            quit,
        ))(input)
        .map_err(|e| anyhow::anyhow!("parse error: {e}"))?;
        if !rest.trim().is_empty() {
            anyhow::bail!("trailing input: {rest:?}");
        }
        Ok(command)
    }
}

const HELP: &str = "\
commands:
  create <name> <dimension> [hnsw|ivf_flat|flat]
  drop <name>
  collections
  put <collection> <id> <v1,v2,...>
  get <collection> <id>
  del <collection> <id>
  search <collection> <k> <v1,v2,...>
  params <collection> <key>=<value>
  stats
  quit";

fn run(db: &Database, command: Command) -> Result<bool> {
    match command {
        Command::Create {
            name,
            dimension,
            index_type,
        } => {
            let collection = db.create_collection(&CollectionOptions {
                name,
                dimension,
                index_type,
                ..Default::default()
            })?;
            println!(
                "created {} (dim={}, index={})",
                collection.name, collection.dimension, collection.index_type
            );
        }
        Command::Drop { name } => {
            db.delete_collection(&name)?;
            println!("dropped {name}");
        }
        Command::Collections => {
            for c in db.list_collections()? {
                println!("{}  dim={} index={}", c.name, c.dimension, c.index_type);
            }
        }
        Command::Put {
            collection,
            id,
            vector,
        } => {
            db.upsert_document(
                &collection,
                Document {
                    id: id.clone(),
                    vector,
                    ..Default::default()
                },
            )?;
            println!("upserted {id}");
        }
        Command::Get { collection, id } => {
            let doc = db.get_document(&collection, &id)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Command::Del { collection, id } => {
            db.delete_document(&collection, &id)?;
            println!("deleted {id}");
        }
        Command::Search {
            collection,
            k,
            vector,
        } => {
            let (ids, distances) = db.search_vectors(&collection, &vector, k)?;
            for (id, dist) in ids.iter().zip(&distances) {
                println!("{id}\t{dist:.6}");
            }
            if ids.is_empty() {
                println!("(no results)");
            }
        }
        Command::Params {
            collection,
            key,
            value,
        } => {
            db.set_params(&collection, &HashMap::from([(key.clone(), value)]))?;
            println!("set {key}");
        }
        Command::Stats => {
            for (level, (count, bytes)) in db.scalar_level_stats().iter().enumerate() {
                if *count > 0 {
                    println!("L{level}: {count} tables, {bytes} bytes");
                }
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(args.log.clone())
        .init();

    let mut opts = Options::new(&args.path)?;
    opts.cache_size = args.cache_size;
    let db = Database::open(opts)?;
    println!("oasisdb at {} — `help` for commands", args.path.display());

    let mut editor = DefaultEditor::new()?;
    loop {
        let line = match editor.readline("oasis> ") {
            Ok(line) => line,
            Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        editor.add_history_entry(line)?;
        match Command::parse(line) {
            Ok(command) => match run(&db, command) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => println!("error: {err}"),
            },
            Err(err) => println!("{err}\n{HELP}"),
        }
    }
    db.close()?;
    Ok(())
}

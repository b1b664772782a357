use clap::{Arg, ArgAction, Command};
use riptide::cluster::database::Database;
use riptide::lifecycle::Siri;
use riptide::logging;
use riptide::net::endpoint::Endpoint;
use std::process;
use uuid::Uuid;

mod config;

use config::Config;

fn main() {
    let matches = Command::new("riptided")
        .version(riptide::DB_VERSION)
        .about("Runs the riptide cluster server.")
        .arg(
            Arg::new("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate the config file and exit"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("CONFIG_FILE")
        .expect("CONFIG_FILE is required");

    let config = Config::load(config_path);

    if matches.get_flag("check") {
        println!("configuration ok");
        return;
    }

    let log = logging::init(config.log.as_ref()).expect("Error building the logger");

    logging::info!(log, "starting riptide server"; "version" => riptide::DB_VERSION);

    let local_uuid = config.cluster.uuid.unwrap_or_else(|| {
        let generated = Uuid::new_v4();
        logging::warn!(log, "no server uuid configured, generated a fresh one";
                       "uuid" => %generated);
        generated
    });

    let endpoint = Endpoint::new(config.client_bind(), config.backend_bind(), &log)
        .unwrap_or_else(|err| panic!("Error binding listeners: {:?}", err));

    let db_path = config.server.db_path.join(&config.cluster.dbname);

    let mut db = Database::open(
        &config.cluster.dbname,
        &db_path,
        local_uuid,
        config.cluster.users.clone(),
        &log,
    )
    .unwrap_or_else(|err| panic!("Error opening database: {:?}", err));

    // Seed the registry on first start; an existing servers.dat wins.
    for seed in config.cluster.servers.iter() {
        if db.servers.contains_key(&seed.uuid) {
            continue;
        }

        db.register_server(seed.uuid, seed.address.clone(), seed.port, seed.pool)
            .unwrap_or_else(|err| panic!("Error registering seed server: {:?}", err));
    }

    if db.local_server().is_none() {
        // Not seeded: register ourselves under the backend bind port.
        let port = config
            .backend_bind()
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        db.register_server(local_uuid, "127.0.0.1".to_string(), port, 0)
            .unwrap_or_else(|err| panic!("Error registering the local server: {:?}", err));

        logging::warn!(log, "local server was not seeded, registered a default entry";
                       "uuid" => %local_uuid,
                       "port" => port);
    }

    let mut siri = Siri::new(endpoint, vec![db], &log)
        .unwrap_or_else(|err| panic!("Error wiring signal handling: {}", err));

    let code = siri.run();

    logging::info!(log, "bye"; "exit_code" => code);

    process::exit(code);
}

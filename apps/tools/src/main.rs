use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use server_api::{auth::hash_password, forms::validate_license_number};
use shared::domain::{DriverId, ManufacturerId};
use storage::{NewDriver, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/taxi.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates a driver account that can log in.
    CreateDriver {
        username: String,
        password: String,
        license_number: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
    },
    CreateManufacturer {
        name: String,
        country: String,
    },
    CreateCar {
        manufacturer_id: i64,
        model: String,
        #[arg(long = "driver")]
        drivers: Vec<i64>,
    },
    Counts,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateDriver {
            username,
            password,
            license_number,
            first_name,
            last_name,
        } => {
            validate_license_number(&license_number).map_err(|message| anyhow!(message))?;
            if password.chars().count() < 8 {
                bail!("password must contain at least 8 characters");
            }
            if storage.username_taken(&username).await? {
                bail!("a driver named '{username}' already exists");
            }
            if storage.license_taken(&license_number, None).await? {
                bail!("license number {license_number} is already registered");
            }
            let password_hash = hash_password(&password)?;
            let driver_id = storage
                .create_driver(&NewDriver {
                    username: &username,
                    first_name: &first_name,
                    last_name: &last_name,
                    license_number: &license_number,
                    password_hash: &password_hash,
                })
                .await?;
            println!("created driver_id={}", driver_id.0);
        }
        Command::CreateManufacturer { name, country } => {
            if storage.manufacturer_name_taken(&name, None).await? {
                bail!("manufacturer '{name}' already exists");
            }
            let manufacturer_id = storage.create_manufacturer(&name, &country).await?;
            println!("created manufacturer_id={}", manufacturer_id.0);
        }
        Command::CreateCar {
            manufacturer_id,
            model,
            drivers,
        } => {
            let manufacturer_id = ManufacturerId(manufacturer_id);
            if storage.get_manufacturer(manufacturer_id).await?.is_none() {
                bail!("manufacturer {} does not exist", manufacturer_id.0);
            }
            let drivers: Vec<DriverId> = drivers.into_iter().map(DriverId).collect();
            let known = storage.existing_driver_ids(&drivers).await?;
            if let Some(missing) = drivers.iter().find(|id| !known.contains(id)) {
                bail!("driver {} does not exist", missing.0);
            }
            let car_id = storage.create_car(&model, manufacturer_id, &drivers).await?;
            println!("created car_id={}", car_id.0);
        }
        Command::Counts => {
            let counts = storage.entity_counts().await?;
            println!(
                "drivers={} cars={} manufacturers={}",
                counts.drivers, counts.cars, counts.manufacturers
            );
        }
    }

    Ok(())
}

//! fundkit - command-line admin tool for fundraising kits.
//!
//! Signs in against the hosted backend and lists, shows, exports, saves and
//! deletes kits and fundraisers. Saving a kit JSON file reconciles it with the
//! stored version, so only changed sections and items are written.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fundkit_core::api::SupabaseClient;
use fundkit_core::auth::{CredentialStore, Session};
use fundkit_core::utils::{format_optional, format_timestamp, truncate_string};
use fundkit_core::{AssetResolver, AssetSlot, Config, Fundraiser, Kit, KitError, KitService};

const USAGE: &str = "\
Usage: fundkit <command> [args]

Commands:
  login [email]                       Sign in and remember the password in the keychain
  logout                              Forget the saved session and password
  status                              Show who is signed in and when the session expires
  kits                                List kits, newest first
  show <kit-id>                       Print a kit with its sections and items
  export <kit-id>                     Print a kit as JSON
  save <kit.json>                     Create a kit, or update it when the file has an id
  delete <kit-id>                     Delete a kit and all its content
  fundraisers                         List fundraisers
  add-fundraiser <name> [description] Create a fundraiser
  remove-fundraiser <id>              Delete a fundraiser, unassigning its kits
  upload <file> [folder]              Upload an image and print its public URL
  attach <kit-id> <destination> <file>
                                      Upload an image into a kit field and save the kit
                                      (header.desktop, header.mobile, sections[s].items[i].image)";

/// Column width for names in listings
const NAME_WIDTH: usize = 36;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=fundkit_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    let arg = |i: usize, what: &str| required(&args, i, what);

    let result = match command.as_str() {
        "login" => login(args.get(1).cloned()).await,
        "logout" => logout(),
        "status" => status(),
        "kits" => list_kits().await,
        "show" => show_kit(arg(1, "kit id")?).await,
        "export" => export_kit(arg(1, "kit id")?).await,
        "save" => save_kit(Path::new(arg(1, "kit file")?)).await,
        "delete" => delete_kit(arg(1, "kit id")?).await,
        "fundraisers" => list_fundraisers().await,
        "add-fundraiser" => add_fundraiser(arg(1, "fundraiser name")?, args.get(2).cloned()).await,
        "remove-fundraiser" => remove_fundraiser(arg(1, "fundraiser id")?).await,
        "upload" => upload(Path::new(arg(1, "file")?), args.get(2).map(String::as_str)).await,
        "attach" => attach(arg(1, "kit id")?, arg(2, "destination")?, Path::new(arg(3, "file")?)).await,
        "help" | "-h" | "--help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    };

    if let Err(ref e) = result {
        report(e);
    }
    result
}

fn required<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .with_context(|| format!("Missing {}\n\n{}", what, USAGE))
}

/// Print every failed operation of a partial save before the summary error.
fn report(error: &anyhow::Error) {
    let Some(kit_error) = error.downcast_ref::<KitError>() else {
        return;
    };
    if let KitError::Incomplete { failures, kit_id, .. } = kit_error {
        if let Some(id) = kit_id {
            eprintln!("Kit {} was only partly saved.", id);
        }
        for failure in failures.iter() {
            eprintln!("  - {}", failure);
        }
    }
    if kit_error.is_retryable() {
        eprintln!("Running the same command again re-reads the stored state and retries.");
    }
}

// ============================================================================
// Session
// ============================================================================

/// Signed-in services for one command.
struct Admin {
    config: Config,
    service: KitService,
    client: SupabaseClient,
}

fn prompt(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(d) => print!("{} [{}]: ", label, d),
        None => print!("{}: ", label),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    match (input.is_empty(), default) {
        (true, Some(d)) => Ok(d.to_string()),
        _ => Ok(input.to_string()),
    }
}

async fn login(email: Option<String>) -> Result<()> {
    let mut config = Config::load()?;
    let client = SupabaseClient::from_config(&config)?;

    let email = match email {
        Some(e) => e,
        None => prompt("Email", config.last_email.as_deref())?,
    };
    if email.is_empty() {
        bail!("Email is required");
    }
    let password = rpassword::prompt_password("Password: ")?;

    println!("Authenticating...");
    let data = client.authenticate(&email, &password).await?;

    if let Err(e) = CredentialStore::store(&email, &password) {
        warn!(error = %e, "Failed to store credentials");
    }
    config.last_email = Some(email.clone());
    config.save()?;

    let mut session = Session::new(config.cache_dir()?);
    session.update(data);
    session.save()?;

    info!(email = %email, "Signed in");
    println!("Signed in as {}", email);
    Ok(())
}

fn logout() -> Result<()> {
    let config = Config::load()?;
    let mut session = Session::new(config.cache_dir()?);
    session.clear()?;

    if let Some(ref email) = config.last_email {
        if let Err(e) = CredentialStore::delete(email) {
            warn!(error = %e, "Failed to delete stored credentials");
        }
    }
    println!("Signed out");
    Ok(())
}

fn status() -> Result<()> {
    let config = Config::load()?;
    let mut session = Session::new(config.cache_dir()?);
    session.load()?;

    match session.data.as_ref() {
        Some(data) if session.is_valid() => println!(
            "Signed in as {} (session expires in {} minutes)",
            data.email,
            data.minutes_until_expiry()
        ),
        Some(data) => println!("Session for {} has expired, the next command renews it", data.email),
        None => println!("Not signed in"),
    }
    Ok(())
}

/// Make sure the session holds a usable token: refresh it when close to
/// expiry, and fall back to the keychain password when that fails.
async fn ensure_session(config: &Config, client: &SupabaseClient, session: &mut Session) -> Result<()> {
    if session.data.as_ref().map(|d| !d.needs_refresh()).unwrap_or(false) {
        return Ok(());
    }

    if let Some(data) = session.data.clone() {
        match client.refresh_session(&data.refresh_token, &data.email).await {
            Ok(fresh) => {
                info!("Session refreshed");
                session.update(fresh);
                session.save()?;
                return Ok(());
            }
            Err(e) => warn!(error = %e, "Session refresh failed"),
        }
    }

    let email = config
        .last_email
        .as_deref()
        .context("Not signed in. Run `fundkit login` first.")?;
    let password = CredentialStore::get_password(email)
        .context("Session expired and no stored password. Run `fundkit login`.")?;
    let fresh = client.authenticate(email, &password).await?;
    info!(email = email, "Signed in again with stored credentials");
    session.update(fresh);
    session.save()?;
    Ok(())
}

async fn connect() -> Result<Admin> {
    let config = Config::load()?;
    let client = SupabaseClient::from_config(&config)?;

    let mut session = Session::new(config.cache_dir()?);
    session.load()?;
    ensure_session(&config, &client, &mut session).await?;

    let token = session
        .token()
        .context("Not signed in. Run `fundkit login` first.")?
        .to_string();
    let client = client.with_token(token);

    let service = KitService::new(Arc::new(client.clone()), Arc::new(session))
        .with_timeout(config.request_timeout());
    Ok(Admin { config, service, client })
}

impl Admin {
    fn resolver(&self, folder: Option<&str>) -> AssetResolver {
        let folder = folder.unwrap_or(self.config.upload_folder.as_str()).to_string();
        AssetResolver::new(Arc::new(self.client.clone()), folder).with_timeout(self.config.request_timeout())
    }
}

// ============================================================================
// Kits
// ============================================================================

async fn list_kits() -> Result<()> {
    let admin = connect().await?;
    let kits = admin.service.list_kits().await?;
    if kits.is_empty() {
        println!("No kits yet");
        return Ok(());
    }

    for kit in &kits {
        println!(
            "{:<24} {:<width$} {:<13} {}",
            kit.id.as_deref().unwrap_or("-"),
            truncate_string(&kit.name, NAME_WIDTH),
            format_timestamp(kit.created_at),
            format_optional(&kit.fundraiser_id, "no fundraiser"),
            width = NAME_WIDTH,
        );
    }
    Ok(())
}

fn print_kit(kit: &Kit) {
    println!("{} ({})", kit.name, kit.id.as_deref().unwrap_or("unsaved"));
    if let Some(ref description) = kit.description {
        println!("  {}", description);
    }
    println!("  desktop header: {}", format_optional(&kit.header_desktop_image, "-"));
    println!("  mobile header:  {}", format_optional(&kit.header_mobile_image, "-"));
    println!("  fundraiser:     {}", format_optional(&kit.fundraiser_id, "none"));
    println!("  created:        {}", format_timestamp(kit.created_at));

    for section in &kit.sections {
        println!(
            "  [{}] {} <{}> ({} items)",
            section.position,
            section.name,
            section.section_type,
            section.items.len()
        );
        for item in &section.items {
            println!("      {}. {}", item.position, truncate_string(&item.title, NAME_WIDTH * 2));
        }
    }
}

async fn show_kit(id: &str) -> Result<()> {
    let admin = connect().await?;
    let kit = admin.service.get_kit(id).await?;
    print_kit(&kit);
    Ok(())
}

async fn export_kit(id: &str) -> Result<()> {
    let admin = connect().await?;
    let kit = admin.service.get_kit(id).await?;
    println!("{}", serde_json::to_string_pretty(&kit)?);
    Ok(())
}

async fn save_kit(path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let kit: Kit = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse kit from {}", path.display()))?;

    let admin = connect().await?;
    let saved = match kit.id {
        Some(_) => admin.service.update_kit(&kit).await?,
        None => admin.service.create_kit(&kit).await?,
    };

    println!(
        "Saved kit {} with {} sections and {} items",
        saved.id.as_deref().unwrap_or("-"),
        saved.sections.len(),
        saved.item_count()
    );
    Ok(())
}

async fn delete_kit(id: &str) -> Result<()> {
    let admin = connect().await?;
    admin.service.delete_kit(id).await?;
    println!("Deleted kit {}", id);
    Ok(())
}

// ============================================================================
// Fundraisers
// ============================================================================

async fn list_fundraisers() -> Result<()> {
    let admin = connect().await?;
    for fundraiser in admin.service.list_fundraisers().await? {
        println!(
            "{:<24} {:<width$} {}",
            fundraiser.id.as_deref().unwrap_or("-"),
            truncate_string(&fundraiser.name, NAME_WIDTH),
            fundraiser.display_description(),
            width = NAME_WIDTH,
        );
    }
    Ok(())
}

async fn add_fundraiser(name: &str, description: Option<String>) -> Result<()> {
    let admin = connect().await?;
    let fundraiser = admin
        .service
        .create_fundraiser(&Fundraiser {
            description,
            ..Fundraiser::new(name)
        })
        .await?;
    println!("Created fundraiser {}", fundraiser.id.as_deref().unwrap_or("-"));
    Ok(())
}

async fn remove_fundraiser(id: &str) -> Result<()> {
    let admin = connect().await?;
    admin.service.delete_fundraiser(id).await?;
    println!("Deleted fundraiser {}", id);
    Ok(())
}

// ============================================================================
// Images
// ============================================================================

/// File name and contents of an image to upload.
fn read_image(path: &Path) -> Result<(&str, Vec<u8>)> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Not a file: {}", path.display()))?;
    Ok((name, bytes))
}

async fn upload(path: &Path, folder: Option<&str>) -> Result<()> {
    let (name, bytes) = read_image(path)?;
    let admin = connect().await?;
    let url = admin.resolver(folder).upload(name, bytes).await?;
    println!("{}", url);
    Ok(())
}

async fn attach(kit_id: &str, destination: &str, path: &Path) -> Result<()> {
    let slot: AssetSlot = destination.parse().map_err(anyhow::Error::msg)?;
    let (name, bytes) = read_image(path)?;

    let admin = connect().await?;
    let mut kit = admin.service.get_kit(kit_id).await?;
    let url = admin.resolver(None).attach(&mut kit, slot, name, bytes).await?;
    admin.service.update_kit(&kit).await?;

    println!("{} = {}", slot, url);
    Ok(())
}

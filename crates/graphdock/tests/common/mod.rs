//! In-process container engine and database client for scenario tests.
//!
//! Server containers keep their graph in memory and persist it to
//! `<data>/graph.json` only on a graceful stop or `STOP DATABASE`, and hold
//! `<data>/store_lock` while the database is online. Agent containers act on
//! the mounted folders the way the administration image does.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use graphdock::database::{
    Credentials, DatabaseIo, Endpoint, GraphConnector, GraphSession, QueryResult, QueryStats,
    SYSTEM_DATABASE,
};
use graphdock::filesystem::{ContainerOwnershipHelper, ResourceManager};
use graphdock::runtime::{
    ContainerHandle, ContainerLogs, ContainerRuntime, ContainerSpec, ContainerState, ExecResult,
    MountSource, WaitStrategy,
};
use graphdock::scenario::ScenarioContext;
use graphdock::scenario::neo4j::{BACKUP_PORT, HTTP_PORT};
use graphdock_common::{HarnessError, HarnessResult, HarnessSettings, Setting, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;

const GRAPH_FILE: &str = "graph.json";
const LOCK_FILE: &str = "store_lock";
const FIRST_HOST_PORT: u16 = 32768;

/// Persisted server state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    pub store_version: Option<Version>,
    pub dogs: bool,
    pub extra_nodes: u64,
    pub scratch_nodes: u64,
}

impl Graph {
    fn load(dir: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(dir.join(GRAPH_FILE)) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| format!("corrupt store: {e}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(format!("cannot read store: {e}")),
        }
    }

    fn save(&self, dir: &Path) {
        let content = serde_json::to_string(self).unwrap();
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(GRAPH_FILE), content).unwrap();
    }
}

struct Server {
    data_dir: PathBuf,
    password: Option<String>,
    graph: Graph,
    online: bool,
}

impl Server {
    fn close(&mut self) {
        if self.online {
            self.graph.save(&self.data_dir);
            let _ = std::fs::remove_file(self.data_dir.join(LOCK_FILE));
            self.online = false;
        }
    }

    fn open(&mut self) -> Result<(), String> {
        self.graph = Graph::load(&self.data_dir)?;
        std::fs::write(self.data_dir.join(LOCK_FILE), b"").map_err(|e| e.to_string())?;
        self.online = true;
        Ok(())
    }
}

struct Container {
    spec: ContainerSpec,
    state: ContainerState,
    output: Vec<String>,
    ports: BTreeMap<u16, u16>,
    server: Option<Server>,
}

#[derive(Default)]
struct World {
    next_id: u64,
    next_port: u16,
    containers: BTreeMap<String, Container>,
    volumes: BTreeMap<String, PathBuf>,
    owners: HashMap<PathBuf, String>,
    events: Vec<String>,
    refuse_chown: bool,
    refused_paths: Vec<PathBuf>,
}

impl World {
    fn container(&self, id: &str) -> HarnessResult<&Container> {
        self.containers.get(id).ok_or_else(|| no_such(id))
    }

    fn container_mut(&mut self, id: &str) -> HarnessResult<&mut Container> {
        self.containers.get_mut(id).ok_or_else(|| no_such(id))
    }

    fn server_on_port(&self, container_port: u16, host_port: u16) -> Option<&Container> {
        self.containers.values().find(|c| {
            c.state == ContainerState::Running
                && c.server.is_some()
                && c.ports.get(&container_port) == Some(&host_port)
        })
    }
}

fn no_such(id: &str) -> HarnessError {
    HarnessError::Runtime {
        message: format!("no such container: {id}"),
    }
}

/// Container engine double sharing one world with its [`FakeConnector`].
#[derive(Clone)]
pub struct FakeRuntime {
    world: Arc<Mutex<World>>,
    volume_root: Arc<TempDir>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            world: Arc::new(Mutex::new(World {
                next_port: FIRST_HOST_PORT,
                ..World::default()
            })),
            volume_root: Arc::new(tempfile::tempdir().unwrap()),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            world: Arc::clone(&self.world),
        }
    }

    /// Engine calls and administration queries, in order.
    pub fn events(&self) -> Vec<String> {
        self.world.lock().events.clone()
    }

    /// Position of the first event starting with `prefix`.
    pub fn event_index(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    pub fn live_containers(&self) -> usize {
        self.world.lock().containers.len()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.world.lock().volumes.keys().cloned().collect()
    }

    pub fn owner_of(&self, path: &Path) -> Option<String> {
        self.world.lock().owners.get(path).cloned()
    }

    /// Make every later `chown` in a helper container fail.
    pub fn refuse_chown(&self) {
        self.world.lock().refuse_chown = true;
    }

    /// Make `chown` fail for `path` only.
    pub fn refuse_chown_for(&self, path: &Path) {
        self.world.lock().refused_paths.push(path.to_path_buf());
    }

    fn mount_dirs(&self, world: &mut World, spec: &ContainerSpec) -> BTreeMap<String, PathBuf> {
        spec.mounts
            .iter()
            .map(|binding| {
                let dir = match &binding.source {
                    MountSource::Directory(path) => path.clone(),
                    MountSource::NamedVolume(name) => world
                        .volumes
                        .entry(name.clone())
                        .or_insert_with(|| {
                            let dir = self.volume_root.path().join(name);
                            std::fs::create_dir_all(&dir).unwrap();
                            dir
                        })
                        .clone(),
                };
                (binding.target.clone(), dir)
            })
            .collect()
    }
}

enum Boot {
    Server(Server, Vec<String>),
    Exited(i64, Vec<String>),
    Running,
}

fn boot(world: &World, spec: &ContainerSpec, mounts: &BTreeMap<String, PathBuf>) -> Boot {
    if spec.image.starts_with("neo4j:") {
        match boot_server(world, spec, mounts) {
            Ok(server) => Boot::Server(
                server,
                vec![
                    "Starting...".to_string(),
                    format!("Remote interface available at http://localhost:{HTTP_PORT}/"),
                    "Started.".to_string(),
                ],
            ),
            Err(message) => Boot::Exited(1, vec![message]),
        }
    } else if spec.image.contains("neo4j-admin") {
        let command = spec.command.clone().unwrap_or_default();
        if command.iter().any(|arg| arg == "backup-legacy") {
            run_backup(world, &command, mounts)
        } else if command.iter().any(|arg| arg == "restore-legacy") {
            run_restore(mounts)
        } else {
            Boot::Exited(2, vec![format!("unknown admin command {command:?}")])
        }
    } else {
        Boot::Running
    }
}

fn boot_server(
    world: &World,
    spec: &ContainerSpec,
    mounts: &BTreeMap<String, PathBuf>,
) -> Result<Server, String> {
    let version = Version::from_image_tag(&spec.image).map_err(|e| e.to_string())?;
    let data_dir = mounts
        .get("/data")
        .cloned()
        .ok_or_else(|| "no /data mount".to_string())?;

    if let (Some(user), Some(owner)) = (&spec.user, world.owners.get(&data_dir)) {
        if !user.starts_with("0:") && user != owner {
            return Err(format!(
                "Folder /data is not accessible for user: {user} or group {}",
                user.split(':').nth(1).unwrap_or_default()
            ));
        }
    }

    let mut graph = Graph::load(&data_dir)?;
    if let Some(store) = &graph.store_version {
        if store.is_newer_than(&version) {
            return Err(format!("Store was written by {store} and cannot be opened by {version}"));
        }
        if store.branch() != version.branch() {
            if let Some(var) = Setting::AllowUpgrade.env_var_for(&version) {
                if spec.env.get(&var).map(String::as_str) != Some("true") {
                    return Err(format!(
                        "Failed to start Neo4j: store format {store} requires upgrade, set {var}=true"
                    ));
                }
            }
        }
    }
    graph.store_version = Some(version);

    let password = match spec.env.get("NEO4J_AUTH").map(String::as_str) {
        None | Some("none") => None,
        Some(auth) => auth.split_once('/').map(|(_, pw)| pw.to_string()),
    };
    std::fs::write(data_dir.join(LOCK_FILE), b"").map_err(|e| e.to_string())?;
    Ok(Server {
        data_dir,
        password,
        graph,
        online: true,
    })
}

fn run_backup(world: &World, command: &[String], mounts: &BTreeMap<String, PathBuf>) -> Boot {
    let port = command
        .iter()
        .find_map(|arg| arg.strip_prefix("--from="))
        .and_then(|from| from.rsplit_once(':'))
        .and_then(|(_, port)| port.parse::<u16>().ok());
    let source = port.and_then(|port| world.server_on_port(BACKUP_PORT, port));
    let Some(server) = source.and_then(|c| c.server.as_ref()).filter(|s| s.online) else {
        return Boot::Exited(1, vec![format!("Connection refused: {port:?}")]);
    };
    let Some(backups) = mounts.get("/backups") else {
        return Boot::Exited(1, vec!["no /backups mount".to_string()]);
    };
    server.graph.save(&backups.join("neo4j"));
    Boot::Exited(
        0,
        vec![
            "Doing full backup...".to_string(),
            "Backup complete successful.".to_string(),
        ],
    )
}

fn run_restore(mounts: &BTreeMap<String, PathBuf>) -> Boot {
    let (Some(backups), Some(data)) = (mounts.get("/backups"), mounts.get("/data")) else {
        return Boot::Exited(1, vec!["restore needs /backups and /data".to_string()]);
    };
    if data.join(LOCK_FILE).exists() {
        return Boot::Exited(
            1,
            vec!["The database is in use. Stop database 'neo4j' and try again.".to_string()],
        );
    }
    match Graph::load(&backups.join("neo4j")) {
        Ok(graph) => {
            graph.save(data);
            Boot::Exited(
                0,
                vec![
                    "Restoring neo4j from /backups/neo4j".to_string(),
                    "2024-01-01 INFO restoreStatus=successful, path=/data".to_string(),
                ],
            )
        }
        Err(message) => Boot::Exited(1, vec![message]),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> HarnessResult<ContainerHandle> {
        let mut world = self.world.lock();
        world.next_id += 1;
        let id = format!("{:012x}{}", world.next_id, "f".repeat(52));
        let mut ports = BTreeMap::new();
        for port in &spec.exposed_ports {
            ports.insert(*port, world.next_port);
            world.next_port += 1;
        }
        world.events.push(format!("create {}", spec.image));
        world.containers.insert(
            id.clone(),
            Container {
                spec: spec.clone(),
                state: ContainerState::Created,
                output: Vec::new(),
                ports,
                server: None,
            },
        );
        Ok(ContainerHandle {
            id,
            image: spec.image.clone(),
        })
    }

    async fn start(&self, container: &ContainerHandle) -> HarnessResult<()> {
        let mut world = self.world.lock();
        let spec = world.container(&container.id)?.spec.clone();
        let mounts = self.mount_dirs(&mut world, &spec);
        let booted = boot(&world, &spec, &mounts);
        world.events.push(format!("start {}", spec.image));
        let entry = world.container_mut(&container.id)?;
        match booted {
            Boot::Server(server, lines) => {
                entry.server = Some(server);
                entry.output = lines;
                entry.state = ContainerState::Running;
            }
            Boot::Exited(code, lines) => {
                entry.output = lines;
                entry.state = ContainerState::Exited(code);
            }
            Boot::Running => entry.state = ContainerState::Running,
        }
        Ok(())
    }

    async fn stop(&self, container: &ContainerHandle) -> HarnessResult<()> {
        let mut world = self.world.lock();
        world.events.push(format!("stop {}", container.image));
        let entry = world.container_mut(&container.id)?;
        if entry.state == ContainerState::Running {
            if let Some(server) = &mut entry.server {
                server.close();
                entry.output.push("Stopped.".to_string());
            }
            entry.state = ContainerState::Exited(0);
        }
        Ok(())
    }

    async fn remove(&self, container: &ContainerHandle) -> HarnessResult<()> {
        let mut world = self.world.lock();
        world.events.push(format!("remove {}", container.image));
        world
            .containers
            .remove(&container.id)
            .map(|_| ())
            .ok_or_else(|| no_such(&container.id))
    }

    async fn exec(&self, container: &ContainerHandle, command: &[String]) -> HarnessResult<ExecResult> {
        let mut world = self.world.lock();
        world.events.push(format!("exec {}", command.join(" ")));
        if world.container(&container.id)?.state != ContainerState::Running {
            return Err(HarnessError::Runtime {
                message: format!("container {} is not running", container.short_id()),
            });
        }
        match command {
            [chown, flag, owner, path] if chown == "chown" && flag == "-R" => {
                if world.refuse_chown || world.refused_paths.iter().any(|p| p.as_path() == Path::new(path)) {
                    return Ok(ExecResult {
                        stderr: format!("chown: {path}: Operation not permitted"),
                        exit_code: 1,
                        ..ExecResult::default()
                    });
                }
                world.owners.insert(PathBuf::from(path), owner.clone());
                Ok(ExecResult::default())
            }
            _ => Ok(ExecResult {
                stderr: "command not found".to_string(),
                exit_code: 127,
                ..ExecResult::default()
            }),
        }
    }

    async fn logs(&self, container: &ContainerHandle) -> HarnessResult<ContainerLogs> {
        let world = self.world.lock();
        let entry = world.container(&container.id)?;
        Ok(ContainerLogs {
            stdout: entry.output.join("\n"),
            stderr: String::new(),
        })
    }

    async fn state(&self, container: &ContainerHandle) -> HarnessResult<ContainerState> {
        Ok(self.world.lock().container(&container.id)?.state)
    }

    async fn mapped_port(&self, container: &ContainerHandle, port: u16) -> HarnessResult<u16> {
        let world = self.world.lock();
        world
            .container(&container.id)?
            .ports
            .get(&port)
            .copied()
            .ok_or_else(|| HarnessError::Runtime {
                message: format!("port {port} is not published"),
            })
    }

    fn host(&self) -> String {
        "localhost".to_string()
    }

    async fn remove_volume(&self, name: &str) -> HarnessResult<()> {
        let mut world = self.world.lock();
        world.events.push(format!("remove-volume {name}"));
        let dir = world.volumes.remove(name).ok_or_else(|| HarnessError::Runtime {
            message: format!("no such volume: {name}"),
        })?;
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}

/// Database client double talking to the servers of a [`FakeRuntime`].
pub struct FakeConnector {
    world: Arc<Mutex<World>>,
}

#[async_trait]
impl GraphConnector for FakeConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> HarnessResult<Box<dyn GraphSession>> {
        let world = self.world.lock();
        let (id, container) = world
            .containers
            .iter()
            .find(|(_, c)| {
                c.state == ContainerState::Running
                    && c.server.is_some()
                    && c.ports.get(&HTTP_PORT) == Some(&endpoint.http_port)
            })
            .ok_or_else(|| HarnessError::Database {
                message: format!("connection refused: {}:{}", endpoint.host, endpoint.http_port),
            })?;
        let expected = container.server.as_ref().and_then(|s| s.password.clone());
        let accepted = match (&expected, credentials) {
            (None, _) => true,
            (Some(expected), Credentials::Basic { user, password }) => {
                user == "neo4j" && password == expected
            }
            (Some(_), Credentials::None) => false,
        };
        if !accepted {
            return Err(HarnessError::Database {
                message: "The client is unauthorized due to authentication failure.".to_string(),
            });
        }
        Ok(Box::new(FakeSession {
            world: Arc::clone(&self.world),
            id: id.clone(),
        }))
    }
}

struct FakeSession {
    world: Arc<Mutex<World>>,
    id: String,
}

fn rows(column: &str, values: impl IntoIterator<Item = Value>) -> QueryResult {
    QueryResult {
        columns: vec![column.to_string()],
        rows: values.into_iter().map(|v| vec![v]).collect(),
        stats: QueryStats::default(),
    }
}

fn unavailable(message: impl Into<String>) -> HarnessError {
    HarnessError::Database {
        message: message.into(),
    }
}

#[async_trait]
impl GraphSession for FakeSession {
    async fn run(&self, database: Option<&str>, query: &str) -> HarnessResult<QueryResult> {
        let mut world = self.world.lock();
        if database == Some(SYSTEM_DATABASE) {
            world.events.push(format!("query {query}"));
        }
        let server = world
            .container_mut(&self.id)?
            .server
            .as_mut()
            .ok_or_else(|| unavailable("not a database server"))?;

        if query == "RETURN 1" {
            return Ok(rows("1", [Value::from(1)]));
        }
        if query.starts_with("ALTER CURRENT USER") || query.starts_with("CALL dbms.changePassword") {
            return Ok(QueryResult::default());
        }
        if let Some(name) = query.strip_prefix("STOP DATABASE ") {
            if database != Some(SYSTEM_DATABASE) {
                return Err(unavailable("administration commands must run on system"));
            }
            assert_eq!(name, "neo4j");
            server.close();
            return Ok(QueryResult::default());
        }
        if let Some(name) = query.strip_prefix("START DATABASE ") {
            if database != Some(SYSTEM_DATABASE) {
                return Err(unavailable("administration commands must run on system"));
            }
            assert_eq!(name, "neo4j");
            server.open().map_err(unavailable)?;
            return Ok(QueryResult::default());
        }

        if !server.online {
            return Err(unavailable("Database 'neo4j' is unavailable."));
        }
        let graph = &mut server.graph;
        if query == DatabaseIo::PUT_INITIAL_DATA {
            graph.dogs = true;
            let mut result = rows("arne.name", [Value::from("Arne")]);
            result.stats = QueryStats {
                nodes_created: 2,
                relationships_created: 1,
                ..QueryStats::default()
            };
            Ok(result)
        } else if query == DatabaseIo::VERIFY_INITIAL_DATA {
            Ok(rows("a.name", graph.dogs.then(|| Value::from("Arne"))))
        } else if query == DatabaseIo::PUT_MORE_DATA {
            graph.extra_nodes += 1;
            Ok(QueryResult {
                stats: QueryStats {
                    nodes_created: 1,
                    ..QueryStats::default()
                },
                ..QueryResult::default()
            })
        } else if query == DatabaseIo::VERIFY_MORE_DATA {
            Ok(rows("count(n)", [Value::from(graph.extra_nodes)]))
        } else if query.starts_with("CREATE (node:createAndDeleteNode") {
            graph.scratch_nodes += 1;
            Ok(rows("node.val", [Value::from(1)]))
        } else if query.starts_with("MATCH (node:createAndDeleteNode") {
            let deleted = std::mem::take(&mut graph.scratch_nodes).min(2);
            Ok(QueryResult {
                stats: QueryStats {
                    nodes_deleted: deleted,
                    ..QueryStats::default()
                },
                ..QueryResult::default()
            })
        } else {
            Err(unavailable(format!("unsupported query: {query}")))
        }
    }

    async fn close(&self) -> HarnessResult<()> {
        Ok(())
    }
}

/// Everything a scenario needs, backed by the fakes and a scratch output root.
pub struct Harness {
    pub runtime: FakeRuntime,
    pub connector: FakeConnector,
    pub resources: ResourceManager,
    pub settings: HarnessSettings,
    pub root: TempDir,
}

impl Harness {
    pub fn new(image: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let engine: Arc<dyn ContainerRuntime> = Arc::new(runtime.clone());
        let helper = ContainerOwnershipHelper::new(engine).with_wait(WaitStrategy::Running);
        let resources = ResourceManager::with_seed(root.path(), Arc::new(helper), 42).unwrap();
        let settings = HarnessSettings::for_image(image)
            .unwrap()
            .with_output_root(root.path());
        Self {
            connector: runtime.connector(),
            runtime,
            resources,
            settings,
            root,
        }
    }

    pub fn context(&self) -> ScenarioContext<'_> {
        ScenarioContext {
            runtime: &self.runtime,
            connector: &self.connector,
            resources: &self.resources,
            settings: &self.settings,
        }
    }

    /// Names of the entries directly under the output root.
    pub fn root_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

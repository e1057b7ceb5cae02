//! mergen-init — PID 1 inside the guest.
//!
//! Materializes container-style startup from baked image metadata: base
//! mounts, networking, user, env and argv, then supervises the main process
//! with signal forwarding and zombie reaping until it exits. The init's own
//! exit code is the main process's exit code.
//!
//! Build for guests with:
//! ```bash
//! cargo build --release --bin mergen-init --target x86_64-unknown-linux-musl
//! ```

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("mergen-init only runs inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    linux::main();
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashMap;
    use std::fs::DirBuilder;
    use std::io;
    use std::net::Ipv4Addr;
    use std::os::unix::fs::DirBuilderExt;
    use std::path::Path;
    use std::time::Duration;

    use anyhow::{anyhow, bail, Context, Result};
    use nix::errno::Errno;
    use nix::mount::{mount, MsFlags};
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{Group, Pid, Uid, User};
    use serde::Deserialize;
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{debug, error, info, warn, Level};

    const DEFAULT_META_PATH: &str = "/etc/mergen/image-meta.json";
    const RUN_CONFIG_PATH: &str = "/etc/mergen/run.json";
    const CMDLINE_META_KEY: &str = "mergen.meta=";
    const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

    const FORWARDED_SIGNALS: [i32; 11] = [
        libc::SIGTERM,
        libc::SIGINT,
        libc::SIGHUP,
        libc::SIGQUIT,
        libc::SIGUSR1,
        libc::SIGUSR2,
        libc::SIGWINCH,
        libc::SIGCONT,
        libc::SIGTSTP,
        libc::SIGTTIN,
        libc::SIGTTOU,
    ];

    #[tokio::main(flavor = "current_thread")]
    pub async fn main() {
        init_tracing();
        if std::process::id() != 1 {
            warn!(pid = std::process::id(), "mergen-init is expected to run as PID 1");
        }

        match run().await {
            Ok(code) => std::process::exit(code),
            Err(err) => {
                error!(error = format!("{err:#}"), "init failed");
                std::process::exit(1);
            }
        }
    }

    fn init_tracing() {
        let level = match std::env::var("MERGEN_INIT_LOG_LEVEL")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_ansi(false)
            .compact()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    async fn run() -> Result<i32> {
        setup_base_mounts()?;

        let (spec, source) = load_start_spec()?;
        info!(
            source = %source,
            argv = %spec.argv.join(" "),
            user = %spec.user,
            working_dir = %spec.working_dir,
            "startup config loaded"
        );

        apply_runtime_setup(&spec)?;
        run_and_supervise(spec).await
    }

    // =========================================================================
    // Start spec
    // =========================================================================

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct ImageMeta {
        image: String,
        entrypoint: Vec<String>,
        cmd: Vec<String>,
        start_cmd: Vec<String>,
        env: Vec<String>,
        working_dir: String,
        user: String,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct RunConfig {
        image: Option<RunImage>,
        exec_override: Vec<String>,
        cmd_override: String,
        user_override: String,
        extra_env: HashMap<String, String>,
        hostname: String,
        nameservers: Vec<String>,
        hosts: Vec<HostEntry>,
        mounts: Vec<DeviceMount>,
        ip_configs: Vec<IpConfig>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct RunImage {
        entrypoint: Vec<String>,
        cmd: Vec<String>,
        env: Vec<String>,
        working_dir: String,
        user: String,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct HostEntry {
        ip: String,
        host: String,
        comment: String,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct DeviceMount {
        device: String,
        mount_point: String,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct IpConfig {
        ip: String,
        gateway: String,
        prefix_len: u8,
    }

    #[derive(Debug, Default)]
    struct StartSpec {
        argv: Vec<String>,
        env: HashMap<String, String>,
        user: String,
        working_dir: String,
        hostname: String,
        nameservers: Vec<String>,
        hosts: Vec<HostEntry>,
        mounts: Vec<DeviceMount>,
        ip_configs: Vec<IpConfig>,
    }

    fn load_start_spec() -> Result<(StartSpec, String)> {
        let meta_path = resolve_meta_path(DEFAULT_META_PATH);
        if Path::new(&meta_path).exists() {
            let meta = read_json::<ImageMeta>(&meta_path)
                .with_context(|| format!("read metadata {meta_path}"))?;
            return Ok((spec_from_image_meta(meta), meta_path));
        }

        if Path::new(RUN_CONFIG_PATH).exists() {
            let cfg = read_json::<RunConfig>(RUN_CONFIG_PATH)
                .with_context(|| format!("read run config {RUN_CONFIG_PATH}"))?;
            return Ok((spec_from_run_config(cfg), RUN_CONFIG_PATH.to_string()));
        }

        bail!("no startup metadata found at {meta_path} or {RUN_CONFIG_PATH}")
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
        let body = std::fs::read(path)?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn resolve_meta_path(default_path: &str) -> String {
        let Ok(cmdline) = std::fs::read_to_string("/proc/cmdline") else {
            return default_path.to_string();
        };
        metadata_path_from_cmdline(&cmdline).unwrap_or_else(|| default_path.to_string())
    }

    fn metadata_path_from_cmdline(cmdline: &str) -> Option<String> {
        cmdline
            .split_whitespace()
            .filter_map(|field| field.strip_prefix(CMDLINE_META_KEY))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn spec_from_image_meta(meta: ImageMeta) -> StartSpec {
        let mut argv = meta.start_cmd;
        if argv.is_empty() {
            argv = meta.entrypoint;
            argv.extend(meta.cmd);
        }
        if argv.is_empty() {
            argv = vec!["/bin/sh".to_string()];
        }

        let mut user = meta.user.trim().to_string();
        if user.is_empty() {
            user = "root".to_string();
        }

        StartSpec {
            argv,
            env: parse_env_list(&meta.env),
            user,
            working_dir: meta.working_dir.trim().to_string(),
            ..StartSpec::default()
        }
    }

    fn spec_from_run_config(cfg: RunConfig) -> StartSpec {
        let image = cfg.image.unwrap_or_default();

        let mut argv = cfg.exec_override;
        if argv.is_empty() {
            argv = image.entrypoint;
            let cmd_override = cfg.cmd_override.trim();
            if cmd_override.is_empty() {
                argv.extend(image.cmd);
            } else {
                argv.push(cmd_override.to_string());
            }
        }
        if argv.is_empty() {
            argv = vec!["/bin/sh".to_string()];
        }

        let mut env = parse_env_list(&image.env);
        env.extend(cfg.extra_env);

        let mut user = cfg.user_override.trim().to_string();
        if user.is_empty() {
            user = image.user.trim().to_string();
        }
        if user.is_empty() {
            user = "root".to_string();
        }

        StartSpec {
            argv,
            env,
            user,
            working_dir: image.working_dir.trim().to_string(),
            hostname: cfg.hostname.trim().to_string(),
            nameservers: cfg.nameservers,
            hosts: cfg.hosts,
            mounts: cfg.mounts,
            ip_configs: cfg.ip_configs,
        }
    }

    fn parse_env_list(entries: &[String]) -> HashMap<String, String> {
        let mut env = HashMap::with_capacity(entries.len());
        for entry in entries {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            env.insert(key.to_string(), value.to_string());
        }
        env
    }

    // =========================================================================
    // Mounts & runtime setup
    // =========================================================================

    fn setup_base_mounts() -> Result<()> {
        make_dir("/dev", 0o755)?;
        if let Err(err) = mount_if_needed(
            "devtmpfs",
            "/dev",
            "devtmpfs",
            MsFlags::MS_NOSUID,
            Some("mode=0755"),
        ) {
            warn!(error = %err, "mount /dev failed");
        }

        make_dir("/proc", 0o555)?;
        if let Err(err) = mount_if_needed(
            "proc",
            "/proc",
            "proc",
            MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            None,
        ) {
            warn!(error = %err, "mount /proc failed");
        }

        make_dir("/sys", 0o555)?;
        if let Err(err) = mount_if_needed(
            "sysfs",
            "/sys",
            "sysfs",
            MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            None,
        ) {
            warn!(error = %err, "mount /sys failed");
        }

        make_dir("/dev/pts", 0o755)?;
        if let Err(err) = mount_if_needed(
            "devpts",
            "/dev/pts",
            "devpts",
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NOATIME,
            Some("mode=0620,gid=5,ptmxmode=666"),
        ) {
            warn!(error = %err, "mount /dev/pts failed");
        }

        make_dir("/dev/shm", 0o1777)?;
        if let Err(err) = mount_if_needed(
            "tmpfs",
            "/dev/shm",
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=1777"),
        ) {
            warn!(error = %err, "mount /dev/shm failed");
        }

        make_dir("/run", 0o755)?;
        if let Err(err) = mount_if_needed(
            "tmpfs",
            "/run",
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=0755"),
        ) {
            warn!(error = %err, "mount /run failed");
        }

        make_dir("/tmp", 0o1777)?;
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) =
                std::fs::set_permissions("/tmp", std::fs::Permissions::from_mode(0o1777))
            {
                warn!(error = %err, "chmod /tmp failed");
            }
        }

        let _ = ensure_symlink("/proc/self/fd", "/dev/fd");
        let _ = ensure_symlink("/proc/self/fd/0", "/dev/stdin");
        let _ = ensure_symlink("/proc/self/fd/1", "/dev/stdout");
        let _ = ensure_symlink("/proc/self/fd/2", "/dev/stderr");

        Ok(())
    }

    fn make_dir(path: &str, mode: u32) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
            .with_context(|| format!("prepare {path}"))
    }

    /// Mounting over an existing mount returns EBUSY, which counts as done.
    fn mount_if_needed(
        source: &str,
        target: &str,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        match mount(Some(source), target, Some(fstype), flags, data) {
            Err(Errno::EBUSY) => Ok(()),
            other => other,
        }
    }

    fn ensure_symlink(target: &str, link: &str) -> io::Result<()> {
        if let Ok(current) = std::fs::read_link(link) {
            if current == Path::new(target) {
                return Ok(());
            }
            std::fs::remove_file(link)?;
        }
        std::os::unix::fs::symlink(target, link)
    }

    fn apply_runtime_setup(spec: &StartSpec) -> Result<()> {
        if !spec.hostname.is_empty() {
            if let Err(errno) = nix::unistd::sethostname(&spec.hostname) {
                warn!(hostname = %spec.hostname, error = %errno, "sethostname failed");
            }
            if make_dir("/etc", 0o755).is_ok() {
                let _ = std::fs::write("/etc/hostname", format!("{}\n", spec.hostname));
            }
        }

        if !spec.nameservers.is_empty() {
            make_dir("/etc", 0o755).context("prepare /etc for resolv.conf")?;
            let mut body = String::new();
            for ns in &spec.nameservers {
                let ns = ns.trim();
                if ns.is_empty() {
                    continue;
                }
                body.push_str("nameserver ");
                body.push_str(ns);
                body.push('\n');
            }
            if !body.is_empty() {
                std::fs::write("/etc/resolv.conf", body).context("write /etc/resolv.conf")?;
            }
        }

        if !spec.hosts.is_empty() {
            make_dir("/etc", 0o755).context("prepare /etc for hosts")?;
            let mut body = String::new();
            for entry in &spec.hosts {
                let ip = entry.ip.trim();
                let host = entry.host.trim();
                if ip.is_empty() || host.is_empty() {
                    continue;
                }
                if !entry.comment.trim().is_empty() {
                    body.push_str(&format!("\n# {}\n", entry.comment.trim()));
                }
                body.push_str(&format!("{ip}\t{host}\n"));
            }
            if !body.is_empty() {
                use std::io::Write;
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open("/etc/hosts")
                    .context("open /etc/hosts")?;
                file.write_all(body.as_bytes()).context("append /etc/hosts")?;
            }
        }

        for mount_spec in &spec.mounts {
            let device = mount_spec.device.trim();
            let mount_point = mount_spec.mount_point.trim();
            if device.is_empty() || mount_point.is_empty() {
                continue;
            }
            make_dir(mount_point, 0o755)
                .with_context(|| format!("prepare mount path {mount_point}"))?;
            mount_if_needed(device, mount_point, "ext4", MsFlags::MS_RELATIME, None)
                .with_context(|| format!("mount {device} on {mount_point}"))?;
        }

        if let Err(err) = bring_link_up("lo") {
            warn!(error = %err, "bringing up lo failed");
        }
        if let Err(err) = bring_link_up("eth0") {
            warn!(error = %err, "bringing up eth0 failed");
        }
        if !spec.ip_configs.is_empty() {
            if let Err(err) = apply_ip_configs("eth0", &spec.ip_configs) {
                warn!(error = %err, "applying IP configs failed");
            }
        }

        Ok(())
    }

    // =========================================================================
    // Interface bring-up (raw ioctls, no `ip` binary in the guest)
    // =========================================================================

    struct IoctlSocket(libc::c_int);

    impl IoctlSocket {
        fn open() -> io::Result<IoctlSocket> {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(IoctlSocket(fd))
        }
    }

    impl Drop for IoctlSocket {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }

    fn ifreq_for(iface: &str) -> io::Result<libc::ifreq> {
        let bytes = iface.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name {iface:?}"),
            ));
        }
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ifr.ifr_name.as_mut_ptr() as *mut u8,
                bytes.len(),
            );
        }
        Ok(ifr)
    }

    fn sockaddr_for(addr: Ipv4Addr) -> libc::sockaddr {
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from(addr).to_be(),
            },
            sin_zero: [0; 8],
        };
        // sockaddr and sockaddr_in are layout-compatible for AF_INET.
        unsafe { std::mem::transmute(sin) }
    }

    fn bring_link_up(iface: &str) -> io::Result<()> {
        let sock = IoctlSocket::open()?;
        let mut ifr = ifreq_for(iface)?;

        if unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        }
        if unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn apply_ip_configs(iface: &str, configs: &[IpConfig]) -> io::Result<()> {
        let sock = IoctlSocket::open()?;

        for config in configs {
            let (addr, prefix_len) = parse_ip_config_address(&config.ip, config.prefix_len)
                .map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("parse IP config address {:?}: {err}", config.ip),
                    )
                })?;

            let mut ifr = ifreq_for(iface)?;
            ifr.ifr_ifru.ifru_addr = sockaddr_for(addr);
            if unsafe { libc::ioctl(sock.0, libc::SIOCSIFADDR as _, &ifr) } < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut ifr = ifreq_for(iface)?;
            ifr.ifr_ifru.ifru_netmask = sockaddr_for(netmask_from_prefix(prefix_len));
            if unsafe { libc::ioctl(sock.0, libc::SIOCSIFNETMASK as _, &ifr) } < 0 {
                return Err(io::Error::last_os_error());
            }

            let gateway = config.gateway.trim();
            if !gateway.is_empty() {
                let gateway: Ipv4Addr = gateway.split('/').next().unwrap_or(gateway).parse().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid gateway IP {gateway:?}"),
                    )
                })?;
                add_default_route(&sock, gateway)?;
            }
        }

        Ok(())
    }

    fn add_default_route(sock: &IoctlSocket, gateway: Ipv4Addr) -> io::Result<()> {
        let mut route: libc::rtentry = unsafe { std::mem::zeroed() };
        route.rt_dst = sockaddr_for(Ipv4Addr::UNSPECIFIED);
        route.rt_gateway = sockaddr_for(gateway);
        route.rt_genmask = sockaddr_for(Ipv4Addr::UNSPECIFIED);
        route.rt_flags = (libc::RTF_UP | libc::RTF_GATEWAY) as libc::c_ushort;

        if unsafe { libc::ioctl(sock.0, libc::SIOCADDRT as _, &route) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn parse_ip_config_address(raw: &str, prefix_len: u8) -> Result<(Ipv4Addr, u8)> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("empty IP");
        }

        if let Some((addr_part, len_part)) = raw.split_once('/') {
            let addr: Ipv4Addr = addr_part.parse().context("invalid IPv4 address")?;
            let parsed_len: u8 = len_part.parse().context("invalid prefix length")?;
            let len = if prefix_len > 0 { prefix_len } else { parsed_len };
            if len > 32 {
                bail!("prefix length out of range: {len}");
            }
            return Ok((addr, len));
        }

        let addr: Ipv4Addr = raw.parse().context("invalid IPv4 address")?;
        let len = if prefix_len > 0 { prefix_len } else { 32 };
        if len > 32 {
            bail!("prefix length out of range: {len}");
        }
        Ok((addr, len))
    }

    fn netmask_from_prefix(prefix_len: u8) -> Ipv4Addr {
        if prefix_len == 0 {
            return Ipv4Addr::UNSPECIFIED;
        }
        Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len)))
    }

    // =========================================================================
    // User resolution
    // =========================================================================

    fn resolve_user(spec: &str) -> Result<(u32, u32, String)> {
        let spec = spec.trim();
        let spec = if spec.is_empty() { "root" } else { spec };

        let (user_part, group_part) = match spec.split_once(':') {
            Some((user, group)) => (user.trim(), group.trim()),
            None => (spec, ""),
        };

        let (uid, user_info) = resolve_user_part(user_part)?;

        let mut gid = uid;
        let mut home = "/".to_string();
        if let Some(user) = &user_info {
            gid = user.gid.as_raw();
            home = user.dir.display().to_string();
        }

        if !group_part.is_empty() {
            gid = resolve_group_part(group_part)?;
        }

        if home.is_empty() {
            home = "/".to_string();
        }
        Ok((uid, gid, home))
    }

    fn resolve_user_part(value: &str) -> Result<(u32, Option<User>)> {
        let value = if value.is_empty() { "root" } else { value };

        if let Ok(uid) = value.parse::<u32>() {
            // A numeric uid is accepted even when no passwd entry exists.
            let info = User::from_uid(Uid::from_raw(uid)).ok().flatten();
            return Ok((uid, info));
        }

        let user = User::from_name(value)
            .with_context(|| format!("lookup user {value:?}"))?
            .ok_or_else(|| anyhow!("unknown user {value:?}"))?;
        Ok((user.uid.as_raw(), Some(user)))
    }

    fn resolve_group_part(value: &str) -> Result<u32> {
        if let Ok(gid) = value.parse::<u32>() {
            return Ok(gid);
        }
        let group = Group::from_name(value)
            .with_context(|| format!("lookup group {value:?}"))?
            .ok_or_else(|| anyhow!("unknown group {value:?}"))?;
        Ok(group.gid.as_raw())
    }

    // =========================================================================
    // Launch & supervise
    // =========================================================================

    async fn run_and_supervise(mut spec: StartSpec) -> Result<i32> {
        let (uid, gid, home) = resolve_user(&spec.user)?;

        if spec
            .env
            .get("HOME")
            .map_or(true, |value| value.trim().is_empty())
        {
            spec.env.insert("HOME".to_string(), home);
        }
        if spec
            .env
            .get("PATH")
            .map_or(true, |value| value.trim().is_empty())
        {
            spec.env
                .insert("PATH".to_string(), DEFAULT_PATH_ENV.to_string());
        }
        std::env::set_var("PATH", &spec.env["PATH"]);

        if spec.argv.is_empty() {
            spec.argv = vec!["/bin/sh".to_string()];
        }

        let (child, argv) = start_main_process(&spec, uid, gid)?;
        let main_pid = child.id() as i32;
        info!(pid = main_pid, argv = %argv.join(" "), "started main process");

        supervise(main_pid).await
    }

    fn start_main_process(
        spec: &StartSpec,
        uid: u32,
        gid: u32,
    ) -> Result<(std::process::Child, Vec<String>)> {
        use std::os::unix::process::CommandExt;

        let mut last_err: Option<io::Error> = None;
        for (attempt, argv) in command_candidates(&spec.argv).into_iter().enumerate() {
            let mut command = std::process::Command::new(&argv[0]);
            command
                .args(&argv[1..])
                .env_clear()
                .envs(&spec.env)
                .uid(uid)
                .gid(gid)
                .process_group(0);
            if !spec.working_dir.is_empty() {
                command.current_dir(&spec.working_dir);
            }

            match command.spawn() {
                Ok(child) => return Ok((child, argv)),
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        argv = %argv.join(" "),
                        error = %err,
                        "start command attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(anyhow!(
            "start command {:?}: {}",
            spec.argv.join(" "),
            last_err.map(|err| err.to_string()).unwrap_or_else(|| "no command candidates".into())
        ))
    }

    /// The primary argv, then a `/bin/sh -lc` rendition as a fallback when
    /// the primary binary cannot be executed directly.
    fn command_candidates(argv: &[String]) -> Vec<Vec<String>> {
        let primary: Vec<String> = if argv.is_empty() {
            vec!["/bin/sh".to_string()]
        } else {
            argv.to_vec()
        };

        let mut candidates = vec![primary.clone()];
        let shell_line = shell_command_line(&primary);
        if !shell_line.is_empty() {
            let fallback = vec!["/bin/sh".to_string(), "-lc".to_string(), shell_line];
            if fallback != primary {
                candidates.push(fallback);
            }
        }
        candidates
    }

    fn shell_command_line(argv: &[String]) -> String {
        argv.iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn shell_quote(raw: &str) -> String {
        if raw.is_empty() {
            return "''".to_string();
        }
        format!("'{}'", raw.replace('\'', r#"'"'"'"#))
    }

    async fn supervise(main_pid: i32) -> Result<i32> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<i32>(64);
        for raw in FORWARDED_SIGNALS {
            let mut stream = signal(SignalKind::from_raw(raw))
                .with_context(|| format!("subscribe signal {raw}"))?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(raw).await.is_err() {
                        break;
                    }
                }
            });
        }
        let mut sigchld = signal(SignalKind::child()).context("subscribe SIGCHLD")?;
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            if let Some(code) = reap_children(main_pid)? {
                info!(pid = main_pid, exit_code = code, "main process exited");
                return Ok(code);
            }

            tokio::select! {
                _ = sigchld.recv() => {}
                received = rx.recv() => {
                    if let Some(raw) = received {
                        forward_signal(main_pid, raw);
                    }
                }
                _ = tick.tick() => {}
            }
        }
    }

    /// Forwards to the main process group; falls back to the direct PID when
    /// the group is already gone.
    fn forward_signal(main_pid: i32, raw: i32) {
        let Ok(sig) = Signal::try_from(raw) else {
            return;
        };
        match kill(Pid::from_raw(-main_pid), sig) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                if let Err(errno) = kill(Pid::from_raw(main_pid), sig) {
                    if errno != Errno::ESRCH {
                        warn!(signal = %sig, error = %errno, "signal forwarding failed");
                    }
                }
            }
            Err(errno) => warn!(signal = %sig, error = %errno, "signal forwarding failed"),
        }
    }

    /// Reaps every exited child without blocking. Returns the exit code once
    /// the reaped PID is the main process.
    fn reap_children(main_pid: i32) -> Result<Option<i32>> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    if let Some((pid, code)) = exit_code_of(status) {
                        if pid == main_pid {
                            return Ok(Some(code));
                        }
                        debug!(pid, exit_code = code, "reaped child");
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(errno) => bail!("waitpid: {errno}"),
            }
        }
    }

    /// Shell-style exit codes: the raw code for normal exits, 128+signal for
    /// signaled exits.
    fn exit_code_of(status: WaitStatus) -> Option<(i32, i32)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid.as_raw(), code)),
            WaitStatus::Signaled(pid, sig, _) => Some((pid.as_raw(), 128 + sig as i32)),
            _ => None,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn metadata_path_comes_from_the_kernel_cmdline() {
            let cmdline = "console=ttyS0 root=/dev/vdb mergen.meta=/etc/mergen/image-meta.json panic=1";
            assert_eq!(
                metadata_path_from_cmdline(cmdline).as_deref(),
                Some("/etc/mergen/image-meta.json")
            );
            assert_eq!(metadata_path_from_cmdline("console=ttyS0 panic=1"), None);
            assert_eq!(metadata_path_from_cmdline("mergen.meta= panic=1"), None);
        }

        #[test]
        fn env_list_parsing_skips_malformed_entries() {
            let env = parse_env_list(&[
                "A=1".to_string(),
                "B=".to_string(),
                "INVALID".to_string(),
                " =x".to_string(),
                "C=hello=world".to_string(),
            ]);
            assert_eq!(env.get("A").map(String::as_str), Some("1"));
            assert_eq!(env.get("B").map(String::as_str), Some(""));
            assert!(!env.contains_key("INVALID"));
            assert!(!env.contains_key(" "));
            assert_eq!(env.get("C").map(String::as_str), Some("hello=world"));
        }

        #[test]
        fn image_meta_argv_falls_back_to_entrypoint_plus_cmd() {
            let spec = spec_from_image_meta(ImageMeta {
                entrypoint: vec!["python".into()],
                cmd: vec!["app.py".into()],
                env: vec!["FOO=bar".into()],
                ..ImageMeta::default()
            });
            assert_eq!(spec.argv, vec!["python", "app.py"]);
            assert_eq!(spec.user, "root");
            assert_eq!(spec.env.get("FOO").map(String::as_str), Some("bar"));
        }

        #[test]
        fn image_meta_start_cmd_takes_priority() {
            let spec = spec_from_image_meta(ImageMeta {
                entrypoint: vec!["ignored".into()],
                cmd: vec!["ignored".into()],
                start_cmd: vec!["/usr/bin/myapp".into(), "--flag".into()],
                ..ImageMeta::default()
            });
            assert_eq!(spec.argv, vec!["/usr/bin/myapp", "--flag"]);
        }

        #[test]
        fn empty_image_meta_defaults_to_a_shell() {
            let spec = spec_from_image_meta(ImageMeta::default());
            assert_eq!(spec.argv, vec!["/bin/sh"]);
        }

        #[test]
        fn run_config_overrides_win_over_image_defaults() {
            let spec = spec_from_run_config(RunConfig {
                image: Some(RunImage {
                    entrypoint: vec!["/srv/app".into()],
                    cmd: vec!["serve".into()],
                    env: vec!["A=from-image".into()],
                    user: "app".into(),
                    ..RunImage::default()
                }),
                cmd_override: "migrate".into(),
                user_override: "1000:1000".into(),
                extra_env: HashMap::from([("A".to_string(), "from-run".to_string())]),
                ..RunConfig::default()
            });
            assert_eq!(spec.argv, vec!["/srv/app", "migrate"]);
            assert_eq!(spec.user, "1000:1000");
            assert_eq!(spec.env.get("A").map(String::as_str), Some("from-run"));

            let exec_spec = spec_from_run_config(RunConfig {
                exec_override: vec!["/bin/custom".into()],
                ..RunConfig::default()
            });
            assert_eq!(exec_spec.argv, vec!["/bin/custom"]);
        }

        #[test]
        fn command_candidates_add_a_shell_fallback() {
            let candidates = command_candidates(&["python".to_string(), "app py".to_string()]);
            assert_eq!(candidates.len(), 2);
            assert_eq!(candidates[0], vec!["python", "app py"]);
            assert_eq!(
                candidates[1],
                vec!["/bin/sh", "-lc", "'python' 'app py'"]
            );
        }

        #[test]
        fn shell_quoting_survives_embedded_quotes() {
            assert_eq!(shell_quote(""), "''");
            assert_eq!(shell_quote("plain"), "'plain'");
            assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        }

        #[test]
        fn numeric_user_without_passwd_entry_is_accepted() {
            let (uid, gid, home) = resolve_user("54321").unwrap();
            assert_eq!(uid, 54321);
            // Without a passwd entry the gid defaults to the uid.
            assert_eq!(gid, uid);
            assert_eq!(home, "/");

            let (_, gid, _) = resolve_user("54321:4242").unwrap();
            assert_eq!(gid, 4242);
        }

        #[test]
        fn unknown_named_user_is_an_error() {
            assert!(resolve_user("definitely-not-a-user-xyz").is_err());
        }

        #[test]
        fn exit_codes_follow_shell_conventions() {
            assert_eq!(
                exit_code_of(WaitStatus::Exited(Pid::from_raw(7), 3)),
                Some((7, 3))
            );
            assert_eq!(
                exit_code_of(WaitStatus::Signaled(Pid::from_raw(9), Signal::SIGKILL, false)),
                Some((9, 137))
            );
            assert_eq!(
                exit_code_of(WaitStatus::Stopped(Pid::from_raw(5), Signal::SIGSTOP)),
                None
            );
        }

        #[test]
        fn netmask_derivation() {
            assert_eq!(netmask_from_prefix(24), Ipv4Addr::new(255, 255, 255, 0));
            assert_eq!(netmask_from_prefix(32), Ipv4Addr::new(255, 255, 255, 255));
            assert_eq!(netmask_from_prefix(0), Ipv4Addr::UNSPECIFIED);
        }

        #[test]
        fn ip_config_addresses_accept_optional_prefix() {
            assert_eq!(
                parse_ip_config_address("172.30.0.2/24", 0).unwrap(),
                ("172.30.0.2".parse().unwrap(), 24)
            );
            assert_eq!(
                parse_ip_config_address("172.30.0.2", 16).unwrap(),
                ("172.30.0.2".parse().unwrap(), 16)
            );
            assert_eq!(
                parse_ip_config_address("172.30.0.2", 0).unwrap(),
                ("172.30.0.2".parse().unwrap(), 32)
            );
            assert!(parse_ip_config_address("", 0).is_err());
            assert!(parse_ip_config_address("not-an-ip", 0).is_err());
        }
    }
}

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::instrument;
use xcb::{
    screensaver::{QueryInfo, QueryInfoReply},
    x::{self, Atom, Drawable, GetProperty, GrabServer, InternAtom, UngrabServer, Window, ATOM_ANY},
    Connection,
};

use super::{WindowProbe, WindowSample};

fn intern(conn: &Connection, name: &[u8]) -> Result<Atom> {
    let reply = conn.wait_for_reply(conn.send_request(&InternAtom {
        only_if_exists: false,
        name,
    }))?;
    Ok(reply.atom())
}

fn get_pid(conn: &Connection, window: Window, pid_atom: Atom) -> Result<Option<u32>> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window,
        property: pid_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    Ok(result.value::<u32>().first().copied())
}

fn get_active_window(conn: &Connection, root: Window, active_window_atom: Atom) -> Result<Window> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window: root,
        property: active_window_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    result
        .value::<Window>()
        .first()
        .copied()
        .ok_or_else(|| anyhow!("_NET_ACTIVE_WINDOW is not set"))
}

fn get_name(conn: &Connection, window: Window, wm_name_atom: Atom) -> Result<String> {
    let wm_name = conn.wait_for_reply(conn.send_request(&x::GetProperty {
        delete: false,
        window,
        property: wm_name_atom,
        r#type: x::ATOM_ANY,
        long_offset: 0,
        long_length: 1024,
    }))?;
    Ok(String::from_utf8_lossy(wm_name.value()).into_owned())
}

pub struct X11WindowProbe {
    connection: Connection,
    preferred_screen: usize,
    active_window_atom: Atom,
    window_name_atom: Atom,
    pid_atom: Atom,
    system: System,
}

impl X11WindowProbe {
    pub fn new() -> Result<Self> {
        let (connection, preferred_screen) =
            Connection::connect(None).context("Failed to connect to the X server")?;
        let active_window_atom = intern(&connection, b"_NET_ACTIVE_WINDOW")?;
        let window_name_atom = intern(&connection, b"_NET_WM_NAME")?;
        let pid_atom = intern(&connection, b"_NET_WM_PID")?;
        Ok(Self {
            connection,
            preferred_screen: preferred_screen.max(0) as usize,
            active_window_atom,
            window_name_atom,
            pid_atom,
            system: System::new(),
        })
    }

    fn root(&self) -> Result<Window> {
        // Currently the application only supports 1 x11 screen.
        self.connection
            .get_setup()
            .roots()
            .nth(self.preferred_screen)
            .map(|v| v.root())
            .ok_or_else(|| anyhow!("X screen {} doesn't exist", self.preferred_screen))
    }

    /// Executable path and working directory of `pid`.
    fn process_details(&mut self, pid: u32) -> Option<(String, Option<String>)> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing()
                .with_exe(UpdateKind::OnlyIfNotSet)
                .with_cwd(UpdateKind::Always),
        );
        let process = self.system.process(pid)?;
        let exe = process.exe()?.to_str()?.to_string();
        let cwd = process
            .cwd()
            .and_then(|v| v.to_str())
            .filter(|v| *v != "/")
            .map(ToString::to_string);
        Some((exe, cwd))
    }

    #[instrument(skip(self))]
    fn sample_inner(&mut self) -> Result<WindowSample> {
        let root = self.root()?;
        let active_window = get_active_window(&self.connection, root, self.active_window_atom)?;
        let window_title = get_name(&self.connection, active_window, self.window_name_atom)?;
        let pid = get_pid(&self.connection, active_window, self.pid_atom)?
            .ok_or_else(|| anyhow!("Active window has no _NET_WM_PID"))?;
        let (app_name, project_path) = self
            .process_details(pid)
            .ok_or_else(|| anyhow!("Process {pid} of the active window is gone"))?;
        Ok(WindowSample {
            app_name: app_name.into(),
            window_title: window_title.into(),
            project_path: project_path.map(Into::into),
        })
    }
}

impl WindowProbe for X11WindowProbe {
    #[instrument(skip(self))]
    fn sample(&mut self) -> Result<WindowSample> {
        let _ = self.connection.send_request(&GrabServer {});
        let result = self.sample_inner();
        let _ = self.connection.send_request(&UngrabServer {});
        result
    }

    #[instrument(skip(self))]
    fn idle_time(&mut self) -> Result<Duration> {
        let root = self.root()?;
        let idle = self.connection.send_request(&QueryInfo {
            drawable: Drawable::Window(root),
        });
        let reply: QueryInfoReply = self.connection.wait_for_reply(idle)?;
        Ok(Duration::from_millis(u64::from(reply.ms_since_user_input())))
    }
}

use std::{
    io::{self, BufRead, BufReader, BufWriter, Write},
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver, TryRecvError},
    thread::JoinHandle,
};
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::steps::StepLogic;
use crate::Record;

/// Step que delega en un proceso externo: un registro por línea en stdin,
/// un registro por línea en stdout.
///
/// Un hilo lector drena stdout continuamente para que el proceso nunca se
/// bloquee escribiendo mientras nosotros le escribimos.
pub struct PipeLogic {
    command: String,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    lines: Receiver<io::Result<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    finished: bool,
}

impl PipeLogic {
    pub fn spawn(command: &str) -> Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| FlowError::StepLogic(format!("no se pudo lanzar `{command}`: {e}")))?;

        let stdin = child.stdin.take().map(BufWriter::new);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FlowError::StepLogic(format!("`{command}` sin stdout")))?;

        let (tx, rx) = mpsc::channel();
        let reader = std::thread::spawn(move || {
            for line in BufReader::new(stdout).split(b'\n') {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        debug!("pipe lanzado: {}", command);
        Ok(Self {
            command: command.to_string(),
            child,
            stdin,
            lines: rx,
            reader: Some(reader),
            finished: false,
        })
    }

    fn drain_ready(&mut self, out: &mut Vec<Record>) -> Result<()> {
        loop {
            match self.lines.try_recv() {
                Ok(line) => out.push(self.line_result(line)?),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn line_result(&self, line: io::Result<Vec<u8>>) -> Result<Record> {
        line.map_err(|e| FlowError::StepLogic(format!("error leyendo de `{}`: {e}", self.command)))
    }
}

impl StepLogic for PipeLogic {
    fn process(&mut self, _input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| FlowError::StepLogic("pipe ya cerrado".to_string()))?;
        stdin
            .write_all(&record)
            .and_then(|_| stdin.write_all(b"\n"))
            .map_err(|e| {
                FlowError::StepLogic(format!("error escribiendo a `{}`: {e}", self.command))
            })?;
        self.drain_ready(out)
    }

    fn finish(&mut self, out: &mut Vec<Record>) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().map_err(|e| {
                FlowError::StepLogic(format!("error escribiendo a `{}`: {e}", self.command))
            })?;
            // cerrar stdin le indica EOF al proceso
        }

        // el canal se cierra cuando el hilo lector ve EOF en stdout
        while let Ok(line) = self.lines.recv() {
            out.push(self.line_result(line)?);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        let status = self.child.wait()?;
        self.finished = true;
        if !status.success() {
            return Err(FlowError::StepLogic(format!(
                "`{}` terminó con {status}",
                self.command
            )));
        }
        Ok(())
    }
}

impl Drop for PipeLogic {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

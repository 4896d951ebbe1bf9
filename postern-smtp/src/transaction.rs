use postern_common::internal;
use postern_plugins::TransactionView;
use postern_spool::{MessageSpool, SpoolConfig};

/// Message headers in arrival order, with folded lines joined.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, String)>,
    raw: Vec<String>,
}

impl Header {
    /// Feed one header line, without its terminator.
    pub fn add_line(&mut self, line: &str) {
        self.raw.push(line.to_string());

        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = self.fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            return;
        }

        if let Some((name, value)) = line.split_once(':') {
            self.fields
                .push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    /// Every value of `name`, case-insensitively, in order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn get<'a>(&'a self, name: &str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    #[must_use]
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// The header lines exactly as received.
    #[must_use]
    pub fn raw(&self) -> &[String] {
        &self.raw
    }
}

/// One `MAIL` ... `DATA` cycle.
///
/// Owned by exactly one session and replaced wholesale on reset.
#[derive(Debug)]
pub struct Transaction {
    pub id: String,
    pub mail_from: String,
    pub mail_params: Vec<String>,
    pub rcpt_to: Vec<String>,
    pub header: Header,
    pub data_bytes: u64,
    in_header: bool,
    spool: MessageSpool,
    spool_error: Option<String>,
}

impl Transaction {
    /// Start a transaction for `MAIL FROM`; `id` is `<connection id>.<sequence>`.
    #[must_use]
    pub fn new(id: String, mail_from: String, mail_params: Vec<String>, spool: SpoolConfig) -> Self {
        Self {
            spool: MessageSpool::new(spool, id.as_str()),
            id,
            mail_from,
            mail_params,
            rcpt_to: Vec::new(),
            header: Header::default(),
            data_bytes: 0,
            in_header: true,
            spool_error: None,
        }
    }

    /// Append one unstuffed DATA line.
    ///
    /// A spool failure is remembered and the rest of the message discarded,
    /// so the client still gets a reply after the final dot.
    pub async fn append(&mut self, line: &[u8]) {
        self.data_bytes += line.len() as u64;

        if self.in_header {
            let text = postern_spool::trim_terminator(line);
            if text.is_empty() {
                self.in_header = false;
            } else {
                self.header.add_line(&String::from_utf8_lossy(text));
            }
        }

        if self.spool_error.is_some() {
            return;
        }

        if let Err(err) = self.spool.append(line).await {
            self.spool_error = Some(err.to_string());
        }
    }

    /// Flush the spool once the final dot arrived.
    pub async fn finish(&mut self) -> Result<(), String> {
        if let Some(err) = self.spool_error.take() {
            return Err(err);
        }

        self.spool.finish().await.map_err(|err| err.to_string())
    }

    /// Drop the transaction and any spill file behind its message.
    pub async fn discard(self) {
        let id = self.id;
        if let Err(err) = self.spool.destroy().await {
            internal!(level = WARN, "Unable to remove spool for {id}: {err}");
        }
    }

    #[must_use]
    pub const fn message(&self) -> &MessageSpool {
        &self.spool
    }

    #[must_use]
    pub fn view(&self) -> TransactionView {
        TransactionView {
            id: self.id.clone(),
            mail_from: Some(self.mail_from.clone()),
            rcpt_to: self.rcpt_to.clone(),
            data_bytes: self.data_bytes,
            header: self.header.fields.clone(),
        }
    }
}

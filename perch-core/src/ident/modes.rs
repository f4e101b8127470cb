//! Packing and unpacking compound MODE strings.

/// A single `+x arg` / `-x` change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub adding: bool,
    pub mode: char,
    pub arg: Option<String>,
}

impl ModeChange {
    pub fn new(adding: bool, mode: char, arg: Option<&str>) -> Self {
        Self {
            adding,
            mode,
            arg: arg.map(str::to_string),
        }
    }

    pub fn sign(&self) -> char {
        if self.adding { '+' } else { '-' }
    }
}

/// Which channel modes take arguments, per ISUPPORT `PREFIX` and `CHANMODES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeClasses {
    /// Membership modes (`ov`...), always take a nick.
    pub prefix: String,
    /// Type A: list modes, always take an argument.
    pub list: String,
    /// Type B: always take an argument.
    pub always: String,
    /// Type C: take an argument only when set.
    pub on_set: String,
    /// Type D: never take an argument.
    pub never: String,
}

impl Default for ModeClasses {
    fn default() -> Self {
        Self {
            prefix: "ohv".into(),
            list: "beIq".into(),
            always: "k".into(),
            on_set: "l".into(),
            never: "imnpst".into(),
        }
    }
}

impl ModeClasses {
    pub fn takes_arg(&self, adding: bool, mode: char) -> bool {
        self.prefix.contains(mode)
            || self.list.contains(mode)
            || self.always.contains(mode)
            || (adding && self.on_set.contains(mode))
    }
}

/// Unpack `["+ov-b", "a", "b", "mask"]` into primitive changes, consuming
/// arguments left to right only for modes that take one.
///
/// A mode that needs an argument but finds none gets `None`.
pub fn separate_modes(args: &[impl AsRef<str>], classes: &ModeClasses) -> Vec<ModeChange> {
    let mut changes = Vec::new();
    let Some((modestr, rest)) = args.split_first() else {
        return changes;
    };
    let mut params = rest.iter().map(AsRef::as_ref);
    let mut adding = true;
    for c in modestr.as_ref().chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            mode => {
                let arg = if classes.takes_arg(adding, mode) {
                    params.next()
                } else {
                    None
                };
                changes.push(ModeChange::new(adding, mode, arg));
            }
        }
    }
    changes
}

/// Pack changes into a single mode string followed by its arguments.
pub fn join_modes(changes: &[ModeChange]) -> Vec<String> {
    let mut modestr = String::new();
    let mut args = Vec::new();
    let mut last_sign = None;
    for change in changes {
        if last_sign != Some(change.adding) {
            modestr.push(change.sign());
            last_sign = Some(change.adding);
        }
        modestr.push(change.mode);
        if let Some(arg) = &change.arg {
            args.push(arg.clone());
        }
    }
    let mut out = vec![modestr];
    out.extend(args);
    out
}

/// Split changes into MODE argument lists of at most `max_per_line`
/// argument-taking changes each (ISUPPORT `MODES`).
pub fn chunk_modes(changes: &[ModeChange], max_per_line: usize) -> Vec<Vec<String>> {
    let max = max_per_line.max(1);
    let mut out = Vec::new();
    let mut current: Vec<ModeChange> = Vec::new();
    let mut with_args = 0;
    for change in changes {
        if change.arg.is_some() {
            if with_args == max {
                out.push(join_modes(&current));
                current.clear();
                with_args = 0;
            }
            with_args += 1;
        }
        current.push(change.clone());
    }
    if !current.is_empty() {
        out.push(join_modes(&current));
    }
    out
}

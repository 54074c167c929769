//! Task naming.
//!
//! A [`TaskName`] is what appears in configuration: either a bare task
//! (`build`) or qualified with a package (`web#build`). A [`TaskId`] is a
//! fully resolved `package#task` pair identifying one node in the task
//! graph. Both borrow where possible and can be upgraded to `'static` with
//! `into_owned`.

use std::{borrow::Cow, fmt};

use serde::Serialize;

pub const TASK_DELIMITER: &str = "#";
pub const ROOT_PKG_NAME: &str = "//";

#[derive(Debug, thiserror::Error)]
#[error("'{input}' is not a task id: expected the form package{TASK_DELIMITER}task")]
pub struct TaskIdError {
    input: String,
}

/// One concrete `package#task` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

/// A task reference from configuration, possibly package-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_static(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn parse(input: &'a str) -> Result<Self, TaskIdError> {
        match input.split_once(TASK_DELIMITER) {
            // A leading `#` is not a package separator.
            Some((package, task)) if !package.is_empty() && !task.is_empty() => Ok(Self {
                package: package.into(),
                task: task.into(),
            }),
            _ => Err(TaskIdError {
                input: input.to_string(),
            }),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn in_workspace(&self, workspace: &str) -> bool {
        self.package == workspace
    }

    pub fn into_owned(self) -> TaskId<'static> {
        TaskId {
            package: self.package.into_owned().into(),
            task: self.task.into_owned().into(),
        }
    }

    /// The bare task name, dropping the package qualifier.
    pub fn as_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }
}

impl<'a> TaskName<'a> {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn is_package_qualified(&self) -> bool {
        self.package.is_some()
    }

    /// Upgrades to a `TaskId` when the name carries a package qualifier.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        Some(TaskId {
            package: self.package.as_deref()?.into(),
            task: self.task.as_ref().into(),
        })
    }

    pub fn into_owned(self) -> TaskName<'static> {
        TaskName {
            package: self.package.map(|p| p.into_owned().into()),
            task: self.task.into_owned().into(),
        }
    }

    /// Drops any package qualifier, leaving the bare task name.
    pub fn into_non_workspace_task(self) -> TaskName<'a> {
        TaskName {
            package: None,
            task: self.task,
        }
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(input: &'a str) -> Self {
        match input.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() && !task.is_empty() => Self {
                package: Some(package.into()),
                task: task.into(),
            },
            _ => Self {
                package: None,
                task: input.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(input: String) -> Self {
        TaskName::from(input.as_str()).into_owned()
    }
}

impl<'a> From<TaskId<'a>> for TaskName<'a> {
    fn from(id: TaskId<'a>) -> Self {
        Self {
            package: Some(id.package),
            task: id.task,
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => f.write_str(&self.task),
        }
    }
}

impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Serialize for TaskName<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("web#build", Some(("web", "build")) ; "qualified")]
    #[test_case("//#build", Some(("//", "build")) ; "root qualified")]
    #[test_case("build", None ; "bare task")]
    #[test_case("#build", None ; "empty package")]
    fn test_task_id_parse(input: &str, expected: Option<(&str, &str)>) {
        let parsed = TaskId::parse(input).ok();
        assert_eq!(
            parsed.as_ref().map(|id| (id.package(), id.task())),
            expected
        );
    }

    #[test_case("web#build", Some("web"), "build" ; "qualified name")]
    #[test_case("lint", None, "lint" ; "bare name")]
    fn test_task_name_from(input: &str, package: Option<&str>, task: &str) {
        let name = TaskName::from(input);
        assert_eq!(name.package(), package);
        assert_eq!(name.task(), task);
    }

    #[test]
    fn test_display_round_trip() {
        let id = TaskId::new("docs", "lint");
        assert_eq!(TaskId::parse(&id.to_string()).unwrap(), id);
    }
}

use std::{error, fmt};

// We distinguish between three kinds of failures:
// 1. There was a problem with the user's input (e.g., a malformed recipe or a failed task)
// 2. The command line itself was invalid (bad flag value, unknown task argument)
// 3. Some system operation (e.g., building a container image) failed
//
// `User` and `System` exit with code 1; `Usage` exits with code 2.
#[derive(Debug)]
pub enum Failure {
    User(String, Option<Box<dyn error::Error + 'static>>),
    Usage(String, Option<Box<dyn error::Error + 'static>>),
    System(String, Option<Box<dyn error::Error + 'static>>),
}

impl Failure {
    // The process exit code this failure maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Failure::User(_, _) | Failure::System(_, _) => 1,
            Failure::Usage(_, _) => 2,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Failure::User(message, None)
            | Failure::Usage(message, None)
            | Failure::System(message, None) => write!(f, "{}", message),
            Failure::User(message, Some(source))
            | Failure::Usage(message, Some(source))
            | Failure::System(message, Some(source)) => {
                write!(f, "{} Reason: {}", message, source)
            }
        }
    }
}

impl error::Error for Failure {
    fn source<'a>(&'a self) -> Option<&'a (dyn error::Error + 'static)> {
        match self {
            Failure::User(_, source) | Failure::Usage(_, source) | Failure::System(_, source) => {
                source.as_ref().map(|e| &**e)
            }
        }
    }
}

// This is a helper function to convert a `std::error::Error` into a user failure. It's written in
// a curried style so it can be used in a higher-order fashion, e.g.,
// `foo.map_err(failure::user("Error doing foo."))`.
pub fn user<E: error::Error + 'static>(message: impl Into<String>) -> impl FnOnce(E) -> Failure {
    let message = message.into();
    move |error: E| Failure::User(message, Some(Box::new(error)))
}

// Like `user`, but for invalid command-line input.
pub fn usage<E: error::Error + 'static>(message: impl Into<String>) -> impl FnOnce(E) -> Failure {
    let message = message.into();
    move |error: E| Failure::Usage(message, Some(Box::new(error)))
}

// Like `user`, but for failed system operations.
pub fn system<E: error::Error + 'static>(message: impl Into<String>) -> impl FnOnce(E) -> Failure {
    let message = message.into();
    move |error: E| Failure::System(message, Some(Box::new(error)))
}

use rocket::launch;

#[launch]
fn rocket() -> _ {
    cellviz::server::rocket()
}
